use serde::{Deserialize, Serialize};

/// Highest priority a task may carry, before or after aging.
pub const MAX_PRIORITY: u8 = 100;

/// Coarse band of a numeric priority, used for reporting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriorityLevel {
    /// 0..=24
    Low,
    /// 25..=49
    Normal,
    /// 50..=74
    High,
    /// 75..=100
    Critical,
}

impl PriorityLevel {
    pub fn from_priority(priority: u8) -> Self {
        match priority.min(MAX_PRIORITY) {
            0..=24 => PriorityLevel::Low,
            25..=49 => PriorityLevel::Normal,
            50..=74 => PriorityLevel::High,
            _ => PriorityLevel::Critical,
        }
    }

    /// Representative numeric priority of the band.
    pub fn default_priority(&self) -> u8 {
        match self {
            PriorityLevel::Low => 10,
            PriorityLevel::Normal => 40,
            PriorityLevel::High => 60,
            PriorityLevel::Critical => 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_cover_full_range() {
        assert_eq!(PriorityLevel::from_priority(0), PriorityLevel::Low);
        assert_eq!(PriorityLevel::from_priority(24), PriorityLevel::Low);
        assert_eq!(PriorityLevel::from_priority(25), PriorityLevel::Normal);
        assert_eq!(PriorityLevel::from_priority(50), PriorityLevel::High);
        assert_eq!(PriorityLevel::from_priority(75), PriorityLevel::Critical);
        assert_eq!(PriorityLevel::from_priority(255), PriorityLevel::Critical);
    }

    #[test]
    fn default_priority_stays_in_band() {
        for level in [
            PriorityLevel::Low,
            PriorityLevel::Normal,
            PriorityLevel::High,
            PriorityLevel::Critical,
        ] {
            assert_eq!(PriorityLevel::from_priority(level.default_priority()), level);
        }
    }
}
