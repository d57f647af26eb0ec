use crate::balancing::state::{AssignedTask, LoadSnapshot};

/// A migration candidate chosen by [`select_transfer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub task: AssignedTask,
    /// Reduction of the pair's maximum deviation from the fleet average
    pub improvement: f64,
}

/// Pick the task whose move to `partner` best reduces the pair's worst deviation.
///
/// The deviation of a pair is `max(|own - average|, |partner - average|)`. Only a
/// strictly positive reduction qualifies; among equal reductions the first task
/// in `tasks` wins.
pub fn select_transfer(
    tasks: &[AssignedTask],
    own: LoadSnapshot,
    partner: LoadSnapshot,
    average: f64,
) -> Option<Transfer> {
    let current = pair_deviation(own.total_time, partner.total_time, average);
    let mut best: Option<Transfer> = None;

    for task in tasks {
        let own_after = own.total_time - own.cost(task.complexity);
        let partner_after = partner.total_time + partner.cost(task.complexity);
        let improvement = current - pair_deviation(own_after, partner_after, average);

        let beats_best = best
            .as_ref()
            .map_or(improvement > 0.0, |b| improvement > b.improvement);
        if beats_best {
            best = Some(Transfer {
                task: task.clone(),
                improvement,
            });
        }
    }

    best
}

fn pair_deviation(a: f64, b: f64, average: f64) -> f64 {
    (a - average).abs().max((b - average).abs())
}
