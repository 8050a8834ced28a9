use serde::{Deserialize, Serialize, Serializer};
use std::fmt::Display;

#[derive(Clone, Hash, PartialEq, Eq, Debug, Serialize)]
enum Error {
    Empty,
    InvalidEscapeSequence,
    DoubleOrTrailingSlash,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Empty => write!(f, "Reference cannot be empty"),
            Error::InvalidEscapeSequence => write!(f, "Reference contains invalid escape sequence"),
            Error::DoubleOrTrailingSlash => {
                write!(f, "Reference contains double or trailing slash")
            }
        }
    }
}

/// Represents an attribute name or path expression identifying a value within a [crate::Context].
///
/// This can be used to retrieve a value with [crate::Context::get_value], and is how clauses,
/// rollouts and segment rules identify the attribute they operate on. Parsing is done once, when
/// the reference is constructed, so that repeated evaluations do not re-parse it.
///
/// If the string starts with '/', then this is treated as a slash-delimited path reference where the
/// first component is the name of an attribute, and subsequent components are the names of nested JSON
/// object properties. In this syntax, the escape sequences "~0" and "~1" represent '~' and '/'
/// respectively within a path component.
///
/// If the string does not start with '/', then it is treated as the literal name of an attribute.
///
/// # Example
/// ```
/// # use launchdarkly_server_sdk_engine::{ContextBuilder, Reference, AttributeValue};
/// # use maplit::hashmap;
/// let context = ContextBuilder::new("123")
///     .name("xyz")
///     .set_value("address", hashmap! { "city" => "Westview" })
///     .set_value("a/b", "ok")
///     .build()
///     .unwrap();
///
/// assert_eq!(context.get_value(&Reference::new("name")),
///     Some(AttributeValue::String("xyz".to_owned())));
/// assert_eq!(context.get_value(&Reference::new("/address/city")),
///     Some(AttributeValue::String("Westview".to_owned())));
/// assert_eq!(context.get_value(&Reference::new("a/b")),
///     Some(AttributeValue::String("ok".to_owned())));
/// assert_eq!(context.get_value(&Reference::new("/a~1b")),
///     Some(AttributeValue::String("ok".to_owned())));
/// ```
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct Reference {
    variant: Variant,
    input: String,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
enum Variant {
    /// A single top-level attribute name, taken verbatim.
    PlainName,
    /// Represents an attribute pointer; starts with a '/'.
    Pointer(Vec<String>),
    /// Represents an invalid input string.
    Error(Error),
}

impl Serialize for Reference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.input)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Reference::new(s))
    }
}

impl Reference {
    /// Construct a new context attribute reference.
    ///
    /// This constructor always returns a reference that preserves the original string, even if
    /// validation fails, so that serializing the reference to JSON will produce the original
    /// string.
    pub fn new<S: AsRef<str>>(value: S) -> Self {
        let value = value.as_ref();

        if value.is_empty() || value == "/" {
            return Self {
                variant: Variant::Error(Error::Empty),
                input: value.to_owned(),
            };
        }

        if !value.starts_with('/') {
            return Self {
                variant: Variant::PlainName,
                input: value.to_owned(),
            };
        }

        let component_result = value[1..]
            .split('/')
            .map(|part| {
                if part.is_empty() {
                    return Err(Error::DoubleOrTrailingSlash);
                }
                Reference::unescape_path(part)
            })
            .collect::<Result<Vec<String>, Error>>();

        match component_result {
            Ok(components) => Self {
                variant: Variant::Pointer(components),
                input: value.to_owned(),
            },
            Err(e) => Self {
                variant: Variant::Error(e),
                input: value.to_owned(),
            },
        }
    }

    /// Construct a reference to a single top-level attribute whose name is taken verbatim, even
    /// if it begins with a '/'. Only an empty name is invalid.
    ///
    /// # Example
    /// ```
    /// # use launchdarkly_server_sdk_engine::Reference;
    /// let reference = Reference::literal("/not/a/path");
    /// assert_eq!(reference.depth(), 1);
    /// assert_eq!(reference.component(0), Some("/not/a/path"));
    /// ```
    pub fn literal<S: AsRef<str>>(name: S) -> Self {
        let name = name.as_ref();
        let variant = if name.is_empty() {
            Variant::Error(Error::Empty)
        } else {
            Variant::PlainName
        };
        Self {
            variant,
            input: name.to_owned(),
        }
    }

    /// Interprets an attribute string found in flag or segment data. Data that names a context
    /// kind uses path syntax; older data that does not is a literal attribute name.
    pub(crate) fn from_attribute(value: String, has_context_kind: bool) -> Self {
        if has_context_kind {
            Reference::new(value)
        } else {
            Reference::literal(value)
        }
    }

    /// Returns true if the reference is valid.
    pub fn is_valid(&self) -> bool {
        !matches!(&self.variant, Variant::Error(_))
    }

    /// If the reference is invalid, this method returns an error description; otherwise, it
    /// returns an empty string.
    pub fn error(&self) -> String {
        match &self.variant {
            Variant::Error(e) => e.to_string(),
            _ => "".to_owned(),
        }
    }

    /// Returns the number of path components in the reference.
    ///
    /// For a simple attribute reference such as "name" with no leading slash, this returns 1.
    ///
    /// For an attribute reference with a leading slash, it is the number of slash-delimited path
    /// components after the initial slash.
    /// # Example
    /// ```
    /// # use launchdarkly_server_sdk_engine::Reference;
    /// assert_eq!(Reference::new("a").depth(), 1);
    /// assert_eq!(Reference::new("/a/b").depth(), 2);
    /// ```
    pub fn depth(&self) -> usize {
        match &self.variant {
            Variant::Pointer(components) => components.len(),
            Variant::PlainName => 1,
            _ => 0,
        }
    }

    /// Retrieves a single path component from the attribute reference.
    ///
    /// Returns the attribute name for a simple attribute reference such as "name" with no leading slash, if index is zero.
    ///
    /// Returns the specified path component if index is less than [Reference::depth], and the reference begins with a slash.
    ///
    /// If index is out of range, it returns None.
    ///
    /// # Examples
    /// ```
    /// # use launchdarkly_server_sdk_engine::Reference;
    /// assert_eq!(Reference::new("a").component(0), Some("a"));
    /// assert_eq!(Reference::new("/a/b").component(1), Some("b"));
    /// assert_eq!(Reference::new("/a/b").component(2), None);
    /// ```
    pub fn component(&self, index: usize) -> Option<&str> {
        match (&self.variant, index) {
            (Variant::Pointer(components), _) => components.get(index).map(|c| c.as_str()),
            (Variant::PlainName, 0) => Some(&self.input),
            _ => None,
        }
    }

    // Checks if the Reference resolves to a Context's 'kind' attribute.
    pub(crate) fn is_kind(&self) -> bool {
        matches!((self.depth(), self.component(0)), (1, Some(comp)) if comp == "kind")
    }

    fn unescape_path(path: &str) -> Result<String, Error> {
        // If there are no tildes then there's definitely nothing to do
        if !path.contains('~') {
            return Ok(path.to_string());
        }

        let mut out = String::with_capacity(path.len());

        let mut iter = path.chars();
        while let Some(c) = iter.next() {
            if c != '~' {
                out.push(c);
                continue;
            }

            let unescaped = match iter.next() {
                Some('0') => '~',
                Some('1') => '/',
                _ => return Err(Error::InvalidEscapeSequence),
            };
            out.push(unescaped);
        }

        Ok(out)
    }
}

impl Default for Reference {
    /// A default [Reference] is empty and invalid.
    fn default() -> Self {
        Reference::new("")
    }
}

/// Displays the input string used to construct the [Reference].
impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.input)
    }
}

impl<S> From<S> for Reference
where
    S: AsRef<str>,
{
    fn from(reference: S) -> Self {
        Reference::new(reference)
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> Self {
        r.input
    }
}
