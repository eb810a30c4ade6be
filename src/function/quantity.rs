use crate::error::ValidationError;

use lazy_static::lazy_static;
use regex::Regex;

use std::fmt::{self, Display};

lazy_static! {
    // <number><suffix>, where suffix is a binary si, decimal si, or decimal exponent
    static ref QUANTITY_REGEX: Regex = Regex::new(
        r"^\+?([0-9]+(\.[0-9]*)?|\.[0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E|[eE][+-]?[0-9]+)?$"
    )
    .unwrap();
}

/// A validated Kubernetes resource quantity such as `128Mi`, `0.5` or `100m`.
/// The original string form is kept as-is, which is how the api server echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(String);

impl Quantity {
    pub fn parse(field: &str, value: &str) -> Result<Quantity, ValidationError> {
        let trimmed = value.trim();
        if QUANTITY_REGEX.is_match(trimmed) {
            Ok(Quantity(trimmed.to_owned()))
        } else {
            Err(ValidationError::new(
                field,
                format!("'{}' is not a valid resource quantity", value),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}
