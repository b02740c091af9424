//! Prudent prefetching.
//!
//! Writing a block sequence to `D` disks with `m` buffers is simulated in
//! discrete time steps: each disk writes at most one block per step and always
//! takes its oldest waiting block first. Reading the blocks back in the
//! reverse of that write order is an optimal prefetch order for the same
//! `m` buffers.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
};

use tracing::trace;

/// Order in which to issue reads for `disks.len()` blocks, block `i` living on
/// disk `disks[i]`, with `prefetch_budget` buffers and `num_disks` disks.
///
/// Blocks on the same disk keep their relative order. With no more blocks than
/// disks everything fits in one step and the identity order is returned.
pub fn compute_prefetch_schedule(
    disks: &[usize],
    prefetch_budget: usize,
    num_disks: usize,
) -> Vec<usize> {
    let len = disks.len();
    if len <= num_disks {
        return (0..len).collect();
    }

    let write_times = simulate_async_write(disks, num_disks, prefetch_budget);

    // Blocks written last are read first; ties keep block order.
    let mut order: Vec<usize> = (0..len).collect();
    order.sort_by_key(|&block| Reverse(write_times[block]));

    trace!(blocks = len, num_disks, prefetch_budget, "computed prefetch schedule");
    order
}

/// Simulated write time (1-based step) of every block when the sequence is
/// written back to front with `budget` buffers.
///
/// Disk numbers at or above `num_disks` share one extra queue.
pub fn simulate_async_write(disks: &[usize], num_disks: usize, budget: usize) -> Vec<usize> {
    let len = disks.len();
    let budget = budget.max(1);
    let queue_of = |block: usize| disks[block].min(num_disks);

    let mut queues: Vec<VecDeque<usize>> = vec![VecDeque::new(); num_disks + 1];
    let mut busy = vec![false; num_disks + 1];
    let mut times = vec![0usize; len];

    // `remaining` blocks are still unseen; the next candidate is `remaining - 1`.
    let mut remaining = len;
    while remaining > 0 && len - remaining < budget {
        remaining -= 1;
        queues[queue_of(remaining)].push_back(remaining);
    }

    let mut events: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();
    for queue in queues.iter_mut() {
        if let Some(block) = queue.pop_front() {
            events.push(Reverse((1, block)));
        }
    }

    let mut now = 0;
    while let Some(Reverse((time, block))) = events.pop() {
        if time != now {
            busy.iter_mut().for_each(|b| *b = false);
            now = time;
        }
        times[block] = time;

        if remaining > 0 {
            let candidate = remaining - 1;
            let disk = queue_of(candidate);
            if busy[disk] {
                queues[disk].push_back(candidate);
                remaining -= 1;
            } else {
                let next = match queues[disk].pop_front() {
                    Some(waiting) => waiting,
                    None => {
                        remaining -= 1;
                        candidate
                    }
                };
                events.push(Reverse((time + 1, next)));
                busy[disk] = true;
            }
        }

        let disk = queue_of(block);
        if !busy[disk] {
            if let Some(waiting) = queues[disk].pop_front() {
                events.push(Reverse((time + 1, waiting)));
                busy[disk] = true;
            }
        }
    }

    debug_assert_eq!(0, remaining, "blocks left unscheduled");
    debug_assert!(queues.iter().all(VecDeque::is_empty), "blocks left waiting");
    debug_assert!(times.iter().all(|&t| t > 0), "block without write time");

    times
}
