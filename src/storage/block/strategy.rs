//! Disk selection for newly allocated blocks.
//!
//! Every strategy maps a block's sequence number to a disk in `[begin, end)`.
//! Randomized strategies own their generator; build them with `seeded` for
//! reproducible placement.

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

pub trait AllocStrategy: Send {
    /// Disk for the `i`-th block.
    fn disk(&mut self, i: usize) -> usize;

    fn name(&self) -> &'static str;
}

fn width(begin: usize, end: usize) -> usize {
    assert!(begin < end, "empty disk range [{begin}, {end})");
    end - begin
}

fn permutation(rng: &mut StdRng, len: usize) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..len).collect();
    perm.shuffle(rng);
    perm
}

/// Round robin.
#[derive(Debug, Clone)]
pub struct Striping {
    begin: usize,
    diff: usize,
}

impl Striping {
    pub fn new(begin: usize, end: usize) -> Self {
        Self {
            begin,
            diff: width(begin, end),
        }
    }
}

impl AllocStrategy for Striping {
    fn disk(&mut self, i: usize) -> usize {
        self.begin + i % self.diff
    }

    fn name(&self) -> &'static str {
        "striping"
    }
}

/// Independent uniform draw per block.
#[derive(Debug, Clone)]
pub struct FullyRandom {
    begin: usize,
    diff: usize,
    rng: StdRng,
}

impl FullyRandom {
    pub fn new(begin: usize, end: usize, rng: StdRng) -> Self {
        Self {
            begin,
            diff: width(begin, end),
            rng,
        }
    }

    pub fn seeded(begin: usize, end: usize, seed: u64) -> Self {
        Self::new(begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for FullyRandom {
    fn disk(&mut self, _i: usize) -> usize {
        self.begin + self.rng.gen_range(0..self.diff)
    }

    fn name(&self) -> &'static str {
        "fully randomized"
    }
}

/// Striping from a starting disk drawn once.
#[derive(Debug, Clone)]
pub struct SimpleRandom {
    begin: usize,
    diff: usize,
    offset: usize,
}

impl SimpleRandom {
    pub fn new(begin: usize, end: usize, mut rng: StdRng) -> Self {
        let diff = width(begin, end);
        Self {
            begin,
            diff,
            offset: rng.gen_range(0..diff),
        }
    }

    pub fn seeded(begin: usize, end: usize, seed: u64) -> Self {
        Self::new(begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for SimpleRandom {
    fn disk(&mut self, i: usize) -> usize {
        self.begin + (i + self.offset) % self.diff
    }

    fn name(&self) -> &'static str {
        "simple randomized striping"
    }
}

/// Round robin over one random permutation of the disks.
#[derive(Debug, Clone)]
pub struct RandomCyclic {
    begin: usize,
    perm: Vec<usize>,
}

impl RandomCyclic {
    pub fn new(begin: usize, end: usize, mut rng: StdRng) -> Self {
        Self {
            begin,
            perm: permutation(&mut rng, width(begin, end)),
        }
    }

    pub fn seeded(begin: usize, end: usize, seed: u64) -> Self {
        Self::new(begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for RandomCyclic {
    fn disk(&mut self, i: usize) -> usize {
        self.begin + self.perm[i % self.perm.len()]
    }

    fn name(&self) -> &'static str {
        "randomized cycling"
    }
}

#[derive(Debug, Clone)]
pub struct SingleDisk {
    disk: usize,
}

impl SingleDisk {
    pub fn new(disk: usize) -> Self {
        Self { disk }
    }
}

impl AllocStrategy for SingleDisk {
    fn disk(&mut self, _i: usize) -> usize {
        self.disk
    }

    fn name(&self) -> &'static str {
        "single disk"
    }
}

// Interleaved variants. Block `i` is block `i / nruns` of run `i % nruns`;
// each run cycles over the disks on its own.

#[derive(Debug, Clone)]
pub struct InterleavedStriping {
    begin: usize,
    diff: usize,
    nruns: usize,
}

impl InterleavedStriping {
    pub fn new(nruns: usize, begin: usize, end: usize) -> Self {
        Self {
            begin,
            diff: width(begin, end),
            nruns: nruns.max(1),
        }
    }
}

impl AllocStrategy for InterleavedStriping {
    fn disk(&mut self, i: usize) -> usize {
        self.begin + (i / self.nruns) % self.diff
    }

    fn name(&self) -> &'static str {
        "interleaved striping"
    }
}

#[derive(Debug, Clone)]
pub struct InterleavedFullyRandom {
    inner: FullyRandom,
}

impl InterleavedFullyRandom {
    pub fn new(_nruns: usize, begin: usize, end: usize, rng: StdRng) -> Self {
        Self {
            inner: FullyRandom::new(begin, end, rng),
        }
    }

    pub fn seeded(nruns: usize, begin: usize, end: usize, seed: u64) -> Self {
        Self::new(nruns, begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for InterleavedFullyRandom {
    fn disk(&mut self, i: usize) -> usize {
        self.inner.disk(i)
    }

    fn name(&self) -> &'static str {
        "interleaved fully randomized"
    }
}

/// Per-run random starting disk.
#[derive(Debug, Clone)]
pub struct InterleavedSimpleRandom {
    begin: usize,
    diff: usize,
    offsets: Vec<usize>,
}

impl InterleavedSimpleRandom {
    pub fn new(nruns: usize, begin: usize, end: usize, mut rng: StdRng) -> Self {
        let diff = width(begin, end);
        let offsets = (0..nruns.max(1)).map(|_| rng.gen_range(0..diff)).collect();
        Self {
            begin,
            diff,
            offsets,
        }
    }

    pub fn seeded(nruns: usize, begin: usize, end: usize, seed: u64) -> Self {
        Self::new(nruns, begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for InterleavedSimpleRandom {
    fn disk(&mut self, i: usize) -> usize {
        let nruns = self.offsets.len();
        self.begin + (i / nruns + self.offsets[i % nruns]) % self.diff
    }

    fn name(&self) -> &'static str {
        "interleaved simple randomized striping"
    }
}

/// Per-run random permutation of the disks.
#[derive(Debug, Clone)]
pub struct InterleavedRandomCyclic {
    begin: usize,
    perms: Vec<Vec<usize>>,
}

impl InterleavedRandomCyclic {
    pub fn new(nruns: usize, begin: usize, end: usize, mut rng: StdRng) -> Self {
        let diff = width(begin, end);
        let perms = (0..nruns.max(1))
            .map(|_| permutation(&mut rng, diff))
            .collect();
        Self { begin, perms }
    }

    pub fn seeded(nruns: usize, begin: usize, end: usize, seed: u64) -> Self {
        Self::new(nruns, begin, end, StdRng::seed_from_u64(seed))
    }
}

impl AllocStrategy for InterleavedRandomCyclic {
    fn disk(&mut self, i: usize) -> usize {
        let nruns = self.perms.len();
        let perm = &self.perms[i % nruns];
        self.begin + perm[(i / nruns) % perm.len()]
    }

    fn name(&self) -> &'static str {
        "interleaved randomized cycling"
    }
}

#[derive(Debug, Clone)]
pub struct FirstDiskOnly {
    begin: usize,
}

impl FirstDiskOnly {
    pub fn new(_nruns: usize, begin: usize, end: usize) -> Self {
        assert!(begin < end, "empty disk range [{begin}, {end})");
        Self { begin }
    }
}

impl AllocStrategy for FirstDiskOnly {
    fn disk(&mut self, _i: usize) -> usize {
        self.begin
    }

    fn name(&self) -> &'static str {
        "first disk only"
    }
}

#[cfg(test)]
pub mod test {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn all(nruns: usize, begin: usize, end: usize, seed: u64) -> Vec<Box<dyn AllocStrategy>> {
        vec![
            Box::new(Striping::new(begin, end)),
            Box::new(FullyRandom::seeded(begin, end, seed)),
            Box::new(SimpleRandom::seeded(begin, end, seed)),
            Box::new(RandomCyclic::seeded(begin, end, seed)),
            Box::new(SingleDisk::new(begin)),
            Box::new(InterleavedStriping::new(nruns, begin, end)),
            Box::new(InterleavedFullyRandom::seeded(nruns, begin, end, seed)),
            Box::new(InterleavedSimpleRandom::seeded(nruns, begin, end, seed)),
            Box::new(InterleavedRandomCyclic::seeded(nruns, begin, end, seed)),
            Box::new(FirstDiskOnly::new(nruns, begin, end)),
        ]
    }

    fn counts(strategy: &mut dyn AllocStrategy, begin: usize, end: usize, n: usize) -> Vec<usize> {
        let mut counts = vec![0; end - begin];
        for i in 0..n {
            counts[strategy.disk(i) - begin] += 1;
        }
        counts
    }

    fn assert_balanced(counts: &[usize]) {
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "unbalanced {counts:?}");
    }

    #[test]
    fn strategies_stay_in_range_test() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let begin = rng.gen_range(0..4);
            let end = begin + rng.gen_range(1..9);
            let nruns = rng.gen_range(1..6);
            for mut strategy in all(nruns, begin, end, rng.gen()) {
                for i in 0..500 {
                    let disk = strategy.disk(i);
                    assert!(
                        (begin..end).contains(&disk),
                        "{} returned {disk} outside [{begin}, {end})",
                        strategy.name()
                    );
                }
            }
        }
    }

    #[test]
    fn striping_balanced_test() {
        for n in [0, 1, 7, 8, 9, 100, 101] {
            assert_balanced(&counts(&mut Striping::new(2, 6), 2, 6, n));
        }
        let mut striping = Striping::new(0, 3);
        let disks: Vec<usize> = (0..7).map(|i| striping.disk(i)).collect();
        assert_eq!(vec![0, 1, 2, 0, 1, 2, 0], disks);
    }

    #[test]
    fn random_cyclic_balanced_test() {
        for seed in 0..20 {
            for n in [5, 16, 33] {
                assert_balanced(&counts(&mut RandomCyclic::seeded(1, 5, seed), 1, 5, n));
            }
        }
    }

    #[test]
    fn random_cyclic_is_a_cycle_test() {
        let mut strategy = RandomCyclic::seeded(0, 6, 42);
        let first: Vec<usize> = (0..6).map(|i| strategy.disk(i)).collect();
        let second: Vec<usize> = (6..12).map(|i| strategy.disk(i)).collect();
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!((0..6).collect::<Vec<_>>(), sorted);
    }

    #[test]
    fn seeded_strategies_are_reproducible_test() {
        let mut a = FullyRandom::seeded(0, 8, 99);
        let mut b = FullyRandom::seeded(0, 8, 99);
        for i in 0..100 {
            assert_eq!(a.disk(i), b.disk(i));
        }

        let mut a = SimpleRandom::seeded(0, 8, 3);
        let mut b = SimpleRandom::seeded(0, 8, 3);
        assert_eq!(a.disk(0), b.disk(0));
    }

    #[test]
    fn simple_random_stripes_from_offset_test() {
        let mut strategy = SimpleRandom::seeded(0, 4, 11);
        let start = strategy.disk(0);
        for i in 0..12 {
            assert_eq!((start + i) % 4, strategy.disk(i));
        }
    }

    #[test]
    fn interleaved_runs_cycle_independently_test() {
        let nruns = 3;
        let mut strategy = InterleavedStriping::new(nruns, 0, 4);
        for run in 0..nruns {
            let disks: Vec<usize> = (0..8).map(|pos| strategy.disk(pos * nruns + run)).collect();
            assert_eq!(vec![0, 1, 2, 3, 0, 1, 2, 3], disks);
        }

        let mut cyclic = InterleavedRandomCyclic::seeded(nruns, 0, 4, 5);
        for run in 0..nruns {
            let mut disks: Vec<usize> = (0..4).map(|pos| cyclic.disk(pos * nruns + run)).collect();
            disks.sort_unstable();
            assert_eq!(vec![0, 1, 2, 3], disks);
        }

        let mut simple = InterleavedSimpleRandom::seeded(nruns, 0, 4, 5);
        for run in 0..nruns {
            let start = simple.disk(run);
            for pos in 0..8 {
                assert_eq!((start + pos) % 4, simple.disk(pos * nruns + run));
            }
        }
    }

    #[test]
    fn constant_strategies_test() {
        let mut single = SingleDisk::new(3);
        let mut first = FirstDiskOnly::new(4, 2, 5);
        for i in 0..10 {
            assert_eq!(3, single.disk(i));
            assert_eq!(2, first.disk(i));
        }
    }
}
