//! Filesystem selection policies

use crate::pool::Filesystem;
use tapestage_common::AllocMode;
use tapestage_common::config::SelectionPolicy;

/// Pick a filesystem able to hold `size` bytes.
///
/// `cursor` is the round-robin position of the pool, advanced past the
/// chosen filesystem.
#[must_use]
pub fn select(
    policy: SelectionPolicy,
    filesystems: &[Filesystem],
    size: u64,
    mode: AllocMode,
    cursor: &mut usize,
) -> Option<usize> {
    let fits = |fs: &Filesystem| fs.free >= size && fs.free > 0;
    match policy {
        SelectionPolicy::MostFree => filesystems
            .iter()
            .enumerate()
            .filter(|(_, fs)| fits(fs))
            .max_by_key(|(i, fs)| (fs.free, std::cmp::Reverse(*i)))
            .map(|(i, _)| i),
        SelectionPolicy::LeastStreams => filesystems
            .iter()
            .enumerate()
            .filter(|(_, fs)| fits(fs))
            .max_by_key(|(i, fs)| {
                (
                    fs.free / (u64::from(fs.streams(mode)) + 1),
                    std::cmp::Reverse(*i),
                )
            })
            .map(|(i, _)| i),
        SelectionPolicy::RoundRobin => {
            let n = filesystems.len();
            let chosen = (0..n)
                .map(|step| (*cursor + step) % n)
                .find(|&i| fits(&filesystems[i]))?;
            *cursor = (chosen + 1) % n;
            Some(chosen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fs(name: &str, free: u64, write_streams: u32) -> Filesystem {
        Filesystem {
            host: "disk01".into(),
            mount: PathBuf::from(name),
            capacity: 1000,
            free,
            read_streams: 0,
            write_streams,
        }
    }

    #[test]
    fn test_most_free() {
        let set = [fs("/a", 100, 0), fs("/b", 500, 0), fs("/c", 300, 0)];
        let mut cursor = 0;
        assert_eq!(
            select(SelectionPolicy::MostFree, &set, 50, AllocMode::Write, &mut cursor),
            Some(1)
        );
        assert_eq!(
            select(SelectionPolicy::MostFree, &set, 600, AllocMode::Write, &mut cursor),
            None
        );
    }

    #[test]
    fn test_least_streams_weights_by_mode() {
        let set = [fs("/a", 600, 5), fs("/b", 400, 0)];
        let mut cursor = 0;
        // 600 / 6 = 100 against 400 / 1 = 400
        assert_eq!(
            select(SelectionPolicy::LeastStreams, &set, 10, AllocMode::Write, &mut cursor),
            Some(1)
        );
        // read streams are all idle, so the larger filesystem wins
        assert_eq!(
            select(SelectionPolicy::LeastStreams, &set, 10, AllocMode::Read, &mut cursor),
            Some(0)
        );
    }

    #[test]
    fn test_round_robin_skips_full() {
        let set = [fs("/a", 100, 0), fs("/b", 0, 0), fs("/c", 100, 0)];
        let mut cursor = 0;
        let picks: Vec<_> = (0..4)
            .map(|_| select(SelectionPolicy::RoundRobin, &set, 10, AllocMode::Read, &mut cursor))
            .collect();
        assert_eq!(picks, vec![Some(0), Some(2), Some(0), Some(2)]);
    }

    #[test]
    fn test_round_robin_empty_pool() {
        let mut cursor = 0;
        assert_eq!(
            select(SelectionPolicy::RoundRobin, &[], 10, AllocMode::Read, &mut cursor),
            None
        );
    }
}
