use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::ResourceClass;

/// Configuration for resource-class budgets.
/// Maps each resource class to its concurrency limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Per-class limits
    limits: HashMap<ResourceClass, usize>,
    /// Default limit for classes not explicitly configured
    default_limit: usize,
}

impl BudgetConfig {
    /// Create a new budget configuration
    pub fn new(limits: HashMap<ResourceClass, usize>, default_limit: usize) -> Self {
        Self {
            limits,
            default_limit,
        }
    }

    /// Create a new budget configuration with only a default limit
    pub fn with_default(default_limit: usize) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit,
        }
    }

    /// Add a limit for a specific resource class
    pub fn with_limit(mut self, class: ResourceClass, limit: usize) -> Self {
        self.limits.insert(class, limit);
        self
    }

    /// Get the limit for a resource class.
    ///
    /// GPU classes never exceed one concurrent job: the GPU lease is
    /// exclusive.
    pub fn limit(&self, class: ResourceClass) -> usize {
        let limit = self
            .limits
            .get(&class)
            .copied()
            .unwrap_or(self.default_limit);
        if class.requires_gpu() {
            limit.min(1)
        } else {
            limit
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::with_default(1)
            .with_limit(ResourceClass::HeavyAiGpu, 1)
            .with_limit(ResourceClass::LightCpu, 2)
            .with_limit(ResourceClass::IoLight, 4)
    }
}

/// Per-tick concurrency counters, seeded from the durable count of
/// leased/running jobs so the limits survive a scheduler restart.
#[derive(Debug, Clone)]
pub struct ClassBudget {
    config: BudgetConfig,
    counters: HashMap<ResourceClass, usize>,
}

impl ClassBudget {
    pub fn seeded(
        config: BudgetConfig,
        active: HashMap<ResourceClass, usize>,
    ) -> Self {
        Self {
            config,
            counters: active,
        }
    }

    fn current_count(&self, class: ResourceClass) -> usize {
        self.counters.get(&class).copied().unwrap_or(0)
    }

    /// Check if budget is available without acquiring
    pub fn has_budget(&self, class: ResourceClass) -> bool {
        self.current_count(class) < self.config.limit(class)
    }

    /// Take one slot; returns false when the class is at capacity.
    pub fn try_acquire(&mut self, class: ResourceClass) -> bool {
        if !self.has_budget(class) {
            return false;
        }
        *self.counters.entry(class).or_insert(0) += 1;
        true
    }

    pub fn release(&mut self, class: ResourceClass) {
        if let Some(count) = self.counters.get_mut(&class) {
            *count = count.saturating_sub(1);
        }
    }

    /// Returns (current, limit)
    pub fn utilization(&self, class: ResourceClass) -> (usize, usize) {
        (self.current_count(class), self.config.limit(class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforces_concurrency_limits() {
        let config = BudgetConfig::with_default(2);
        let mut budget = ClassBudget::seeded(config, HashMap::new());
        let class = ResourceClass::LightCpu;

        assert!(budget.try_acquire(class));
        assert!(budget.try_acquire(class));
        assert_eq!(budget.utilization(class), (2, 2));

        assert!(!budget.try_acquire(class), "should refuse at capacity");
        assert!(!budget.has_budget(class));

        budget.release(class);
        assert!(budget.try_acquire(class));
        assert_eq!(budget.utilization(class), (2, 2));
    }

    #[test]
    fn test_budget_per_class_limits() {
        let config = BudgetConfig::with_default(2)
            .with_limit(ResourceClass::LightCpu, 1)
            .with_limit(ResourceClass::IoLight, 3);
        let mut budget = ClassBudget::seeded(config, HashMap::new());

        assert!(budget.try_acquire(ResourceClass::LightCpu));
        assert!(!budget.try_acquire(ResourceClass::LightCpu));

        for _ in 0..3 {
            assert!(budget.try_acquire(ResourceClass::IoLight));
        }
        assert!(!budget.try_acquire(ResourceClass::IoLight));
    }

    #[test]
    fn test_gpu_class_clamped_to_one() {
        let config = BudgetConfig::with_default(4)
            .with_limit(ResourceClass::HeavyAiGpu, 8);
        assert_eq!(config.limit(ResourceClass::HeavyAiGpu), 1);
        assert_eq!(config.limit(ResourceClass::IoLight), 4);
    }

    #[test]
    fn test_seeded_counts_consume_budget() {
        let mut active = HashMap::new();
        active.insert(ResourceClass::HeavyAiGpu, 1);
        let mut budget = ClassBudget::seeded(BudgetConfig::default(), active);

        assert!(!budget.has_budget(ResourceClass::HeavyAiGpu));
        assert!(budget.try_acquire(ResourceClass::LightCpu));
    }

    #[test]
    fn test_saturating_release() {
        let mut budget =
            ClassBudget::seeded(BudgetConfig::default(), HashMap::new());

        // Release without ever acquiring - should not underflow
        budget.release(ResourceClass::IoLight);
        assert_eq!(budget.utilization(ResourceClass::IoLight).0, 0);
    }
}
