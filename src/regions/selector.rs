//! Region Selector
//!
//! Strategy-based selection over the available (Healthy or Degraded)
//! regions. A preferred region is honored only while it is Healthy; a
//! Degraded preferred region does not satisfy the preference.
//!
//! Round-robin and weighted selection advance an internal atomic counter
//! so consecutive routings never cluster on the wall clock.

use crate::config::LoadBalancingStrategy;
use crate::error::{ConvoyError, ConvoyResult};
use crate::regions::types::{Region, RegionStatus};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct RegionSelector {
    strategy: LoadBalancingStrategy,
    counter: AtomicU64,
}

impl RegionSelector {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select one region from the healthy-or-degraded subset of `regions`.
    pub fn select_region<'a>(
        &self,
        regions: &'a [Region],
        preferred: Option<&str>,
    ) -> ConvoyResult<&'a Region> {
        let available: Vec<&Region> = regions.iter().filter(|r| r.status.is_available()).collect();
        if available.is_empty() {
            return Err(ConvoyError::NoHealthyRegion);
        }

        if let Some(name) = preferred {
            if let Some(region) = available
                .iter()
                .find(|r| r.name == name && r.status == RegionStatus::Healthy)
            {
                return Ok(*region);
            }
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => Ok(self.pick_round_robin(&available)),
            LoadBalancingStrategy::Weighted => Ok(self.pick_weighted(&available)),
            LoadBalancingStrategy::LatencyBased => Ok(pick_lowest_latency(&available)),
            // Geographic selection is reserved; fall back to priority.
            LoadBalancingStrategy::Geographic | LoadBalancingStrategy::PriorityBased => {
                Ok(pick_highest_priority(&available))
            }
        }
    }

    /// Select up to `count` distinct regions, a valid preferred region
    /// first, the rest in the strategy's preference order.
    pub fn select_regions<'a>(
        &self,
        regions: &'a [Region],
        count: usize,
        preferred: Option<&str>,
    ) -> ConvoyResult<Vec<&'a Region>> {
        if count == 0 {
            return Err(ConvoyError::InvalidArgument(
                "region count must be positive".to_string(),
            ));
        }

        let available: Vec<&Region> = regions.iter().filter(|r| r.status.is_available()).collect();
        if available.is_empty() {
            return Err(ConvoyError::NoHealthyRegion);
        }

        let mut selected: Vec<&Region> = Vec::with_capacity(count.min(available.len()));
        if let Some(name) = preferred {
            if let Some(region) = available
                .iter()
                .find(|r| r.name == name && r.status == RegionStatus::Healthy)
            {
                selected.push(*region);
            }
        }

        let mut ordered = available.clone();
        match self.strategy {
            LoadBalancingStrategy::Weighted => {
                ordered.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.priority.cmp(&b.priority)));
            }
            LoadBalancingStrategy::LatencyBased => {
                ordered.sort_by(|a, b| {
                    latency_key(a)
                        .partial_cmp(&latency_key(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.priority.cmp(&b.priority))
                });
            }
            _ => ordered.sort_by(|a, b| a.priority.cmp(&b.priority)),
        }

        for region in ordered {
            if selected.len() == count {
                break;
            }
            if !selected.iter().any(|r| r.name == region.name) {
                selected.push(region);
            }
        }

        Ok(selected)
    }

    fn pick_round_robin<'a>(&self, available: &[&'a Region]) -> &'a Region {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % available.len();
        available[index]
    }

    fn pick_weighted<'a>(&self, available: &[&'a Region]) -> &'a Region {
        let total_weight: u64 = available.iter().map(|r| r.weight as u64).sum();
        if total_weight == 0 {
            return self.pick_round_robin(available);
        }

        let target = self.counter.fetch_add(1, Ordering::Relaxed) % total_weight;
        let mut cumulative = 0u64;
        for &region in available {
            cumulative += region.weight as u64;
            if cumulative > target {
                return region;
            }
        }
        available[0]
    }
}

/// Regions without recorded metrics sort behind all measured ones.
fn latency_key(region: &Region) -> f64 {
    if region.metrics.avg_latency_ms > 0.0 {
        region.metrics.avg_latency_ms
    } else {
        f64::MAX
    }
}

fn pick_lowest_latency<'a>(available: &[&'a Region]) -> &'a Region {
    let measured = available
        .iter()
        .filter(|r| r.metrics.avg_latency_ms > 0.0)
        .min_by(|a, b| {
            a.metrics
                .avg_latency_ms
                .partial_cmp(&b.metrics.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    match measured {
        Some(region) => *region,
        None => pick_highest_priority(available),
    }
}

fn pick_highest_priority<'a>(available: &[&'a Region]) -> &'a Region {
    available
        .iter()
        .copied()
        .min_by_key(|r| r.priority)
        .expect("available set is never empty here")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> Vec<Region> {
        vec![
            Region::new("us-east-1", 1, 50),
            Region::new("us-west-2", 2, 30),
            Region::new("eu-central-1", 3, 20),
        ]
    }

    #[test]
    fn priority_strategy_prefers_lowest_priority() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let regions = regions();
        let selected = selector.select_region(&regions, None).unwrap();
        assert_eq!(selected.name, "us-east-1");
    }

    #[test]
    fn healthy_preferred_region_wins() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let regions = regions();
        let selected = selector.select_region(&regions, Some("eu-central-1")).unwrap();
        assert_eq!(selected.name, "eu-central-1");
    }

    #[test]
    fn degraded_preferred_region_is_not_honored() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let mut regions = regions();
        regions[2].status = RegionStatus::Degraded;
        let selected = selector.select_region(&regions, Some("eu-central-1")).unwrap();
        assert_eq!(selected.name, "us-east-1");
    }

    #[test]
    fn unhealthy_regions_are_excluded() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let mut regions = regions();
        regions[0].status = RegionStatus::Unhealthy;
        let selected = selector.select_region(&regions, Some("us-east-1")).unwrap();
        assert_eq!(selected.name, "us-west-2");
    }

    #[test]
    fn no_available_region_is_an_error() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let mut regions = regions();
        for region in &mut regions {
            region.status = RegionStatus::Offline;
        }
        assert!(matches!(
            selector.select_region(&regions, None),
            Err(ConvoyError::NoHealthyRegion)
        ));
    }

    #[test]
    fn round_robin_is_fair_over_a_cycle() {
        let selector = RegionSelector::new(LoadBalancingStrategy::RoundRobin);
        let regions = regions();

        let mut counts = std::collections::HashMap::new();
        for _ in 0..30 {
            let selected = selector.select_region(&regions, None).unwrap();
            *counts.entry(selected.name.clone()).or_insert(0u32) += 1;
        }
        for count in counts.values() {
            assert_eq!(*count, 10);
        }
    }

    #[test]
    fn weighted_selection_follows_weights() {
        let selector = RegionSelector::new(LoadBalancingStrategy::Weighted);
        let regions = vec![Region::new("heavy", 1, 80), Region::new("light", 2, 20)];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..100 {
            let selected = selector.select_region(&regions, None).unwrap();
            *counts.entry(selected.name.clone()).or_insert(0u32) += 1;
        }
        assert_eq!(counts["heavy"], 80);
        assert_eq!(counts["light"], 20);
    }

    #[test]
    fn latency_strategy_prefers_measured_fast_region() {
        let selector = RegionSelector::new(LoadBalancingStrategy::LatencyBased);
        let mut regions = regions();
        regions[1].metrics.avg_latency_ms = 12.0;
        regions[2].metrics.avg_latency_ms = 80.0;

        let selected = selector.select_region(&regions, None).unwrap();
        assert_eq!(selected.name, "us-west-2");
    }

    #[test]
    fn latency_strategy_falls_back_to_priority_without_metrics() {
        let selector = RegionSelector::new(LoadBalancingStrategy::LatencyBased);
        let regions = regions();
        let selected = selector.select_region(&regions, None).unwrap();
        assert_eq!(selected.name, "us-east-1");
    }

    #[test]
    fn select_regions_returns_distinct_preferred_first() {
        let selector = RegionSelector::new(LoadBalancingStrategy::Weighted);
        let regions = regions();

        let selected = selector
            .select_regions(&regions, 2, Some("eu-central-1"))
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "eu-central-1");
        assert_eq!(selected[1].name, "us-east-1");
    }

    #[test]
    fn select_regions_caps_at_available_count() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let regions = regions();
        let selected = selector.select_regions(&regions, 10, None).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn zero_count_is_rejected() {
        let selector = RegionSelector::new(LoadBalancingStrategy::PriorityBased);
        let regions = regions();
        assert!(matches!(
            selector.select_regions(&regions, 0, None),
            Err(ConvoyError::InvalidArgument(_))
        ));
    }
}
