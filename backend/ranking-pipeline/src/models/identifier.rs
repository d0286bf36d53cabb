use crate::error::PipelineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Separator joining the two halves of a composite identifier
pub const COMPOSITE_SEPARATOR: &str = ":";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleIdentifierType {
    Product,
    Query,
    Brand,
    Category,
    User,
    Request,
}

impl SimpleIdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimpleIdentifierType::Product => "product",
            SimpleIdentifierType::Query => "query",
            SimpleIdentifierType::Brand => "brand",
            SimpleIdentifierType::Category => "category",
            SimpleIdentifierType::User => "user",
            SimpleIdentifierType::Request => "request",
        }
    }
}

impl FromStr for SimpleIdentifierType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(SimpleIdentifierType::Product),
            "query" => Ok(SimpleIdentifierType::Query),
            "brand" => Ok(SimpleIdentifierType::Brand),
            "category" => Ok(SimpleIdentifierType::Category),
            "user" => Ok(SimpleIdentifierType::User),
            "request" => Ok(SimpleIdentifierType::Request),
            other => Err(PipelineError::Validation(format!(
                "unknown identifier type: {}",
                other
            ))),
        }
    }
}

/// Type tag of an identifier. Composite types keep their halves ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierType {
    Simple(SimpleIdentifierType),
    Composite(SimpleIdentifierType, SimpleIdentifierType),
}

impl IdentifierType {
    pub fn is_composite(&self) -> bool {
        matches!(self, IdentifierType::Composite(..))
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierType::Simple(t) => f.write_str(t.as_str()),
            IdentifierType::Composite(primary, secondary) => write!(
                f,
                "{}{}{}",
                primary.as_str(),
                COMPOSITE_SEPARATOR,
                secondary.as_str()
            ),
        }
    }
}

impl FromStr for IdentifierType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(COMPOSITE_SEPARATOR) {
            Some((primary, secondary)) => Ok(IdentifierType::Composite(
                primary.parse()?,
                secondary.parse()?,
            )),
            None => Ok(IdentifierType::Simple(s.parse()?)),
        }
    }
}

impl From<SimpleIdentifierType> for IdentifierType {
    fn from(t: SimpleIdentifierType) -> Self {
        IdentifierType::Simple(t)
    }
}

impl Serialize for IdentifierType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdentifierType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Typed reference to an addressable entity. Equality is by (type, value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "identifier")]
    value: String,
    identifier_type: IdentifierType,
}

impl Identifier {
    pub fn new(value: impl Into<String>, identifier_type: SimpleIdentifierType) -> Self {
        Self {
            value: value.into(),
            identifier_type: IdentifierType::Simple(identifier_type),
        }
    }

    /// Pair two simple identifiers into one addressable row. Order matters:
    /// `composite(a, b) != composite(b, a)`.
    pub fn composite(primary: &Identifier, secondary: &Identifier) -> crate::Result<Self> {
        match (primary.identifier_type, secondary.identifier_type) {
            (IdentifierType::Simple(p), IdentifierType::Simple(s)) => Ok(Self {
                value: format!("{}{}{}", primary.value, COMPOSITE_SEPARATOR, secondary.value),
                identifier_type: IdentifierType::Composite(p, s),
            }),
            _ => Err(PipelineError::Validation(format!(
                "cannot build a composite identifier from {} and {}",
                primary, secondary
            ))),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn identifier_type(&self) -> IdentifierType {
        self.identifier_type
    }

    pub fn is_composite(&self) -> bool {
        self.identifier_type.is_composite()
    }

    /// Simple type of a non-composite identifier
    pub fn simple_type(&self) -> Option<SimpleIdentifierType> {
        match self.identifier_type {
            IdentifierType::Simple(t) => Some(t),
            IdentifierType::Composite(..) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.identifier_type, self.value)
    }
}
