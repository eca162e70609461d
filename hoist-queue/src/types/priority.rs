use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Job priority: an integer in `0..=9`, higher first.
///
/// Priority is strict: a claim never hands out a lower-priority job while
/// a higher-priority eligible job exists in the same queue. Ties break
/// FIFO by enqueue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 9;

    pub fn new(value: u8) -> QueueResult<Self> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(QueueError::Validation(format!(
                "priority must be in {}..={}, got {value}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert!(Priority::new(0).is_ok());
        assert!(Priority::new(9).is_ok());
        assert!(Priority::new(10).is_err());
    }

    #[test]
    fn higher_value_sorts_higher() {
        assert!(Priority::new(9).unwrap() > Priority::new(1).unwrap());
    }
}
