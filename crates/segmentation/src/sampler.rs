//! Cohort sampler: picks a uniform random share of all known users for
//! auto-enrollment into a new segment.

use crate::call::bounded;
use audience_core::types::BasisPoints;
use audience_core::{AudienceResult, UserStore};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct CohortSampler {
    users: Arc<dyn UserStore>,
    call_timeout: Option<Duration>,
}

impl CohortSampler {
    pub fn new(users: Arc<dyn UserStore>, call_timeout: Option<Duration>) -> Self {
        Self {
            users,
            call_timeout,
        }
    }

    /// Select `floor(share × total)` distinct users.
    pub async fn sample(&self, share: BasisPoints) -> AudienceResult<Vec<String>> {
        let population =
            bounded(self.call_timeout, "all_user_ids", self.users.all_user_ids()).await?;
        let selected = {
            let mut rng = rand::thread_rng();
            select(&population, share, &mut rng)
        };
        debug!(
            population = population.len(),
            selected = selected.len(),
            basis_points = share.get(),
            "Cohort sampled"
        );
        Ok(selected)
    }
}

/// Uniform sample without replacement over the distinct ids in `population`.
pub fn select<R: Rng + ?Sized>(
    population: &[String],
    share: BasisPoints,
    rng: &mut R,
) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(population.len());
    let mut distinct: Vec<&String> = Vec::with_capacity(population.len());
    for id in population {
        if seen.insert(id.as_str()) {
            distinct.push(id);
        }
    }

    let count = share.share_of(distinct.len());
    distinct
        .choose_multiple(rng, count)
        .map(|id| (*id).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn users(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user-{i:05}")).collect()
    }

    #[test]
    fn test_five_percent_of_ten_thousand() {
        let population = users(10_000);
        let share = BasisPoints::try_from(500).unwrap();
        for _ in 0..5 {
            let picked = select(&population, share, &mut rand::thread_rng());
            assert_eq!(picked.len(), 500);
            let distinct: HashSet<&String> = picked.iter().collect();
            assert_eq!(distinct.len(), 500);
        }
    }

    #[test]
    fn test_full_share_selects_everyone() {
        let population = users(37);
        let share = BasisPoints::try_from(10_000).unwrap();
        let mut picked = select(&population, share, &mut StdRng::seed_from_u64(7));
        picked.sort();
        assert_eq!(picked, population);
    }

    #[test]
    fn test_share_rounds_down_to_zero() {
        let population = users(50);
        let share = BasisPoints::try_from(100).unwrap();
        assert!(select(&population, share, &mut StdRng::seed_from_u64(1)).is_empty());
    }

    #[test]
    fn test_duplicate_ids_counted_once() {
        let mut population = users(10);
        population.extend(users(10));
        let share = BasisPoints::try_from(5_000).unwrap();
        let picked = select(&population, share, &mut StdRng::seed_from_u64(3));
        assert_eq!(picked.len(), 5);
        let distinct: HashSet<&String> = picked.iter().collect();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn test_selection_is_not_fixed() {
        let population = users(1_000);
        let share = BasisPoints::try_from(1_000).unwrap();
        let a = select(&population, share, &mut StdRng::seed_from_u64(11));
        let b = select(&population, share, &mut StdRng::seed_from_u64(12));
        assert_ne!(a, b);
    }
}
