use broker_admin::VHostLoad;

/// A pool together with its current load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCandidate {
    pub name: String,
    pub load: VHostLoad,
}

/// Pick the least-loaded pool still below `capacity` queues.
///
/// Pools at or above capacity are filtered out before comparing scores, so a
/// full pool is never chosen even when its message backlog is tiny. Equal
/// scores resolve to the lexicographically smallest name.
#[must_use]
pub fn select_pool(candidates: &[PoolCandidate], capacity: u64) -> Option<&PoolCandidate> {
    candidates
        .iter()
        .filter(|c| c.load.queue_count < capacity)
        .min_by(|a, b| {
            a.load
                .score()
                .cmp(&b.load.score())
                .then_with(|| a.name.cmp(&b.name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, queues: u64, messages: u64) -> PoolCandidate {
        PoolCandidate {
            name: name.to_owned(),
            load: VHostLoad {
                queue_count: queues,
                message_count: messages,
            },
        }
    }

    #[test]
    fn picks_minimum_score_below_capacity() {
        let pools = [pool("a", 5, 30), pool("b", 5, 7), pool("c", 50, 0)];
        let chosen = select_pool(&pools, 20).unwrap();
        assert_eq!(chosen.name, "b");
        assert_eq!(chosen.load.score(), 57);
    }

    #[test]
    fn full_pool_never_chosen_even_if_idle() {
        let pools = [pool("full", 20, 0), pool("busy", 19, 10_000)];
        assert_eq!(select_pool(&pools, 20).unwrap().name, "busy");
    }

    #[test]
    fn none_when_all_full_or_empty() {
        assert!(select_pool(&[pool("a", 20, 0)], 20).is_none());
        assert!(select_pool(&[], 20).is_none());
    }

    #[test]
    fn ties_break_on_name() {
        let pools = [pool("pool-b", 2, 0), pool("pool-a", 2, 0)];
        assert_eq!(select_pool(&pools, 20).unwrap().name, "pool-a");
    }
}
