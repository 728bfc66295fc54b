//! Per-agent dispatch queues.
//!
//! A command sits in its target agent's FIFO until exactly one heartbeat
//! picks it up. The queues are in-memory; the ledger reflects queued runs,
//! so a restart replans from `queued` rows (see `recovery`). One mutex
//! guards the map; every operation is O(1) aside from the map lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use kitt_schemas::{Command, CommandType, RunStatus};
use sqlx::SqlitePool;

/// Returned when an agent's queue is at capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFull {
    pub agent_id: String,
    pub capacity: usize,
}

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dispatch queue for agent {} is full (capacity {})",
            self.agent_id, self.capacity
        )
    }
}

impl std::error::Error for QueueFull {}

pub struct DispatchQueues {
    queues: Mutex<HashMap<String, VecDeque<Command>>>,
    capacity: usize,
}

impl DispatchQueues {
    pub fn new(capacity: usize) -> Self {
        DispatchQueues {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a command to its agent's FIFO. Fails when the queue is full.
    pub fn enqueue(&self, command: Command) -> Result<(), QueueFull> {
        let mut queues = self.queues.lock().expect("dispatch lock poisoned");
        let q = queues.entry(command.agent_id.clone()).or_default();
        if q.len() >= self.capacity {
            return Err(QueueFull {
                agent_id: command.agent_id,
                capacity: self.capacity,
            });
        }
        q.push_back(command);
        Ok(())
    }

    /// Pop the oldest pending command for an agent, if any. The caller owns
    /// the ledger CAS that makes the hand-out stick; a command popped here
    /// is gone from the queue atomically with this call.
    pub fn dequeue(&self, agent_id: &str) -> Option<Command> {
        let mut queues = self.queues.lock().expect("dispatch lock poisoned");
        queues.get_mut(agent_id).and_then(VecDeque::pop_front)
    }

    /// Pop the head only when it is a control command (`stop_container`,
    /// `check_docker`). Used for busy agents: benchmark commands are held
    /// back, but a stop for the in-flight run must still get through.
    pub fn dequeue_control(&self, agent_id: &str) -> Option<Command> {
        let mut queues = self.queues.lock().expect("dispatch lock poisoned");
        let q = queues.get_mut(agent_id)?;
        match q.front() {
            Some(cmd)
                if matches!(
                    cmd.command_type,
                    CommandType::StopContainer | CommandType::CheckDocker
                ) =>
            {
                q.pop_front()
            }
            _ => None,
        }
    }

    /// Put a command back at the head of its agent's queue. Only legal while
    /// the run is still `dispatched` and the agent has not reported it
    /// started; the ledger check gates the requeue.
    pub async fn requeue(&self, pool: &SqlitePool, command: Command) -> Result<bool> {
        let Some(run) = kitt_db::fetch_run_by_command(pool, &command.command_id).await? else {
            return Ok(false);
        };
        if run.status != RunStatus::Dispatched || run.started_at.is_some() {
            return Ok(false);
        }

        let outcome = kitt_db::transition_run(
            pool,
            &run.id,
            RunStatus::Dispatched,
            RunStatus::Queued,
            kitt_db::TransitionFields::default(),
        )
        .await?;
        if outcome != kitt_db::TransitionOutcome::Applied {
            return Ok(false);
        }

        let mut queues = self.queues.lock().expect("dispatch lock poisoned");
        queues
            .entry(command.agent_id.clone())
            .or_default()
            .push_front(command);
        Ok(true)
    }

    pub fn len(&self, agent_id: &str) -> usize {
        let queues = self.queues.lock().expect("dispatch lock poisoned");
        queues.get(agent_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Drop all pending commands for an agent (unregister path).
    pub fn clear_agent(&self, agent_id: &str) {
        let mut queues = self.queues.lock().expect("dispatch lock poisoned");
        queues.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kitt_schemas::{CommandPayload, CommandType};

    fn cmd(agent: &str, id: &str) -> Command {
        Command {
            command_id: id.to_string(),
            agent_id: agent.to_string(),
            command_type: CommandType::RunContainer,
            payload: CommandPayload::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fifo_order_per_agent() {
        let q = DispatchQueues::new(8);
        q.enqueue(cmd("a1", "c1")).unwrap();
        q.enqueue(cmd("a1", "c2")).unwrap();
        q.enqueue(cmd("a2", "c3")).unwrap();

        assert_eq!(q.dequeue("a1").unwrap().command_id, "c1");
        assert_eq!(q.dequeue("a1").unwrap().command_id, "c2");
        assert!(q.dequeue("a1").is_none());
        assert_eq!(q.dequeue("a2").unwrap().command_id, "c3");
    }

    #[test]
    fn enqueue_fails_when_full() {
        let q = DispatchQueues::new(2);
        q.enqueue(cmd("a1", "c1")).unwrap();
        q.enqueue(cmd("a1", "c2")).unwrap();
        let err = q.enqueue(cmd("a1", "c3")).unwrap_err();
        assert_eq!(err.capacity, 2);
        // Other agents unaffected.
        q.enqueue(cmd("a2", "c4")).unwrap();
    }

    #[test]
    fn dequeue_on_unknown_agent_is_none() {
        let q = DispatchQueues::new(2);
        assert!(q.dequeue("ghost").is_none());
    }

    #[test]
    fn dequeue_control_only_pops_control_commands() {
        let q = DispatchQueues::new(8);
        q.enqueue(cmd("a1", "run-1")).unwrap();

        // Head is a benchmark command: held back for a busy agent.
        assert!(q.dequeue_control("a1").is_none());
        assert_eq!(q.len("a1"), 1);

        // A stop command at the head passes through.
        let mut stop = cmd("a1", "stop-1");
        stop.command_type = CommandType::StopContainer;
        let q2 = DispatchQueues::new(8);
        q2.enqueue(stop).unwrap();
        assert_eq!(q2.dequeue_control("a1").unwrap().command_id, "stop-1");
    }
}
