//! Human-readable rendering of command outcomes.

use drover_core::protocol::CommandOutcome;

/// Process exit code when `stop` had to kill workers that ignored the drain.
pub const EXIT_FORCED_KILLS: u8 = 2;

pub fn describe(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Started { desired } => format!("started, {desired} worker(s) desired"),
        CommandOutcome::Stopped { forced_kills: 0 } => "stopped, all workers drained".to_string(),
        CommandOutcome::Stopped { forced_kills } => {
            format!("stopped, {forced_kills} worker(s) killed after the shutdown timeout")
        }
        CommandOutcome::Reloaded {
            replaced,
            generation,
        } => format!("reloaded, {replaced} worker(s) replaced, now generation {generation}"),
        CommandOutcome::Scaled { desired } => format!("scaled to {desired} worker(s)"),
    }
}

/// Exit code for a successfully delivered command.
pub const fn exit_code(outcome: &CommandOutcome) -> u8 {
    match outcome {
        CommandOutcome::Stopped { forced_kills } if *forced_kills > 0 => EXIT_FORCED_KILLS,
        _ => 0,
    }
}
