use serde::{Deserialize, Serialize};

/// Block-reward schedule as a pure function of height, resolving the
/// ambiguity between the two reward paths in the original source (Open
/// Question 1 of SPEC_FULL.md §9): the schedule is configuration, not a
/// hard-coded formula.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenEconomics {
    pub max_supply: u64,
    pub base_reward: u64,
    pub halving_interval_blocks: u64,
}

impl TokenEconomics {
    pub fn base_reward(&self, height: u64) -> u64 {
        if self.halving_interval_blocks == 0 {
            return self.base_reward;
        }
        let halvings = height / self.halving_interval_blocks;
        self.base_reward.checked_shr(halvings as u32).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_halves_on_schedule() {
        let economics = TokenEconomics {
            max_supply: 1_000_000,
            base_reward: 1600,
            halving_interval_blocks: 100,
        };
        assert_eq!(economics.base_reward(0), 1600);
        assert_eq!(economics.base_reward(99), 1600);
        assert_eq!(economics.base_reward(100), 800);
        assert_eq!(economics.base_reward(1000), 1);
    }
}
