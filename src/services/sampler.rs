use rand::Rng;
use std::cmp::Ordering;

/// Weighted sampling without replacement via the exponential-key trick.
///
/// Each item draws `key = -ln(1 - U) / weight` (an exponential variate with
/// rate `weight`); sorting ascending and taking the first `n` selects items
/// with probability proportional to weight, with no removal/renormalization
/// loop — the cost is the same for any `n`. `None` returns a full weighted
/// reordering.
///
/// Weights must be strictly positive; callers filter out zero/negative
/// scores before sampling.
pub fn pick<T, R>(rng: &mut R, weighted: &[(T, f64)], n: Option<usize>) -> Vec<T>
where
    T: Clone,
    R: Rng + ?Sized,
{
    let mut keyed: Vec<(usize, f64)> = weighted
        .iter()
        .enumerate()
        .map(|(index, (_, weight))| {
            let u: f64 = rng.gen();
            (index, -(1.0 - u).ln() / weight)
        })
        .collect();

    keyed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let take = n.unwrap_or(keyed.len()).min(keyed.len());
    keyed
        .into_iter()
        .take(take)
        .map(|(index, _)| weighted[index].0.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn test_returns_at_most_n_items_without_duplicates() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<(u32, f64)> = (0..10).map(|i| (i, 1.0)).collect();

        let picked = pick(&mut rng, &items, Some(4));
        assert_eq!(picked.len(), 4);

        let mut unique = picked.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_n_larger_than_input_returns_everything() {
        let mut rng = StdRng::seed_from_u64(7);
        let items = vec![("a", 1.0), ("b", 2.0)];
        assert_eq!(pick(&mut rng, &items, Some(10)).len(), 2);
    }

    #[test]
    fn test_none_returns_full_reordering() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<(u32, f64)> = (0..5).map(|i| (i, 1.0)).collect();
        assert_eq!(pick(&mut rng, &items, None).len(), 5);
    }

    #[test]
    fn test_empty_input() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<(u32, f64)> = vec![];
        assert!(pick(&mut rng, &items, Some(3)).is_empty());
    }

    #[test]
    fn test_equal_weights_are_selected_uniformly() {
        let mut rng = StdRng::seed_from_u64(42);
        let items: Vec<(usize, f64)> = (0..5).map(|i| (i, 1.0)).collect();
        let trials = 5000;

        let mut first_counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..trials {
            let picked = pick(&mut rng, &items, Some(1));
            *first_counts.entry(picked[0]).or_default() += 1;
        }

        // Expected 1000 each; allow a generous statistical tolerance.
        for i in 0..5 {
            let count = *first_counts.get(&i).unwrap_or(&0);
            assert!(
                (700..=1300).contains(&count),
                "item {} selected {} times out of {}",
                i,
                count,
                trials
            );
        }
    }

    #[test]
    fn test_heavier_weight_wins_most_of_the_time() {
        let mut rng = StdRng::seed_from_u64(1234);
        let items = vec![("heavy", 100.0), ("light", 1.0)];
        let trials = 1000;

        let heavy_first = (0..trials)
            .filter(|_| pick(&mut rng, &items, Some(1))[0] == "heavy")
            .count();

        assert!(
            heavy_first > 900,
            "heavy item won only {} of {} trials",
            heavy_first,
            trials
        );
    }
}
