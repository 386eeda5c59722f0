use crate::config::ExecutionConfig;

/// Tip per submission attempt. Attempt 0 pays the base tip, every later
/// attempt the escalated one, and nothing past `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub tip: u64,
    pub retry_tip: u64,
    pub max_attempts: u32,
}

impl FeeSchedule {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            tip: config.tip,
            retry_tip: config.retry_tip,
            max_attempts: config.max_attempts,
        }
    }

    pub fn fee_for_attempt(&self, attempt: u32) -> Option<u64> {
        if attempt >= self.max_attempts {
            None
        } else if attempt == 0 {
            Some(self.tip)
        } else {
            Some(self.retry_tip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_base_then_escalated() {
        let fees = FeeSchedule::from_config(&ExecutionConfig::default());
        assert_eq!(fees.fee_for_attempt(0), Some(1_000_000));
        assert_eq!(fees.fee_for_attempt(1), Some(5_000_000));
        assert_eq!(fees.fee_for_attempt(2), None);
    }

    #[test]
    fn single_attempt_schedule_never_retries() {
        let fees = FeeSchedule {
            tip: 1,
            retry_tip: 2,
            max_attempts: 1,
        };
        assert_eq!(fees.fee_for_attempt(0), Some(1));
        assert_eq!(fees.fee_for_attempt(1), None);
    }
}
