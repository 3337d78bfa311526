use std::collections::VecDeque;

use tokio::time::Instant;

use super::Route;
use crate::error::PoolError;
use crate::pool::WorkerId;

/// An accepted connection waiting to be assigned to a worker.
#[derive(Debug)]
pub struct ConnectionEvent<P> {
    pub payload: P,
    pub arrived_at: Instant,
    /// Failed hand-offs so far.
    pub attempts: u32,
}

impl<P> ConnectionEvent<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            arrived_at: Instant::now(),
            attempts: 0,
        }
    }
}

/// Outcome of offering a connection to the dispatcher.
#[derive(Debug)]
pub enum Dispatch<P> {
    Assigned(Route, ConnectionEvent<P>),
    /// Held until a worker can take it; `depth` includes this event.
    Queued { depth: usize },
}

/// A connection turned away; the caller owns closing it.
#[derive(Debug)]
pub struct Rejected<P> {
    pub error: PoolError,
    pub event: ConnectionEvent<P>,
}

#[derive(Debug)]
struct Slot {
    route: Route,
    inflight: usize,
}

/// Round-robin over the Ready workers with a bounded FIFO overflow queue.
///
/// The rotation keeps least-recently-chosen workers at the front. A chosen
/// worker moves to the back; a saturated worker is skipped and keeps its
/// place.
#[derive(Debug)]
pub struct Dispatcher<P> {
    rotation: VecDeque<Slot>,
    queue: VecDeque<ConnectionEvent<P>>,
    queue_depth: usize,
    /// 0 means unlimited.
    max_inflight: usize,
}

impl<P> Dispatcher<P> {
    pub const fn new(queue_depth: usize, max_inflight: usize) -> Self {
        Self {
            rotation: VecDeque::new(),
            queue: VecDeque::new(),
            queue_depth,
            max_inflight,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// In-flight connections currently assigned to `id`.
    pub fn inflight(&self, id: WorkerId) -> usize {
        self.rotation
            .iter()
            .find(|s| s.route.id == id)
            .map_or(0, |s| s.inflight)
    }

    /// Current rotation order, next candidate first.
    pub fn order(&self) -> Vec<WorkerId> {
        self.rotation.iter().map(|s| s.route.id).collect()
    }

    /// Replace the Ready set.
    ///
    /// Workers no longer present are excised, new ones join at the tail and
    /// the relative order of the rest is untouched. Returns queued events
    /// that can now be assigned.
    pub fn update_routes(&mut self, routes: &[Route]) -> Vec<(Route, ConnectionEvent<P>)> {
        self.rotation.retain(|slot| routes.iter().any(|r| r.id == slot.route.id));
        for slot in &mut self.rotation {
            if let Some(route) = routes.iter().find(|r| r.id == slot.route.id) {
                slot.route.endpoint.clone_from(&route.endpoint);
            }
        }
        for route in routes {
            if !self.rotation.iter().any(|s| s.route.id == route.id) {
                self.rotation.push_back(Slot {
                    route: route.clone(),
                    inflight: 0,
                });
            }
        }
        self.flush()
    }

    /// Offer a connection.
    pub fn dispatch(
        &mut self,
        event: ConnectionEvent<P>,
    ) -> Result<Dispatch<P>, Rejected<P>> {
        if self.queue.is_empty()
            && let Some(route) = self.pick()
        {
            return Ok(Dispatch::Assigned(route, event));
        }
        if self.queue.len() < self.queue_depth {
            self.queue.push_back(event);
            return Ok(Dispatch::Queued {
                depth: self.queue.len(),
            });
        }
        Err(Rejected {
            error: PoolError::NoCapacity {
                queued: self.queue.len(),
            },
            event,
        })
    }

    /// A connection assigned to `id` finished. Returns queued events that can
    /// now be assigned.
    pub fn complete(&mut self, id: WorkerId) -> Vec<(Route, ConnectionEvent<P>)> {
        if let Some(slot) = self.rotation.iter_mut().find(|s| s.route.id == id) {
            slot.inflight = slot.inflight.saturating_sub(1);
        }
        self.flush()
    }

    /// Drop every queued event, handing them back to the caller.
    pub fn drain_queue(&mut self) -> Vec<ConnectionEvent<P>> {
        self.queue.drain(..).collect()
    }

    fn pick(&mut self) -> Option<Route> {
        let max = self.max_inflight;
        let pos = self
            .rotation
            .iter()
            .position(|s| max == 0 || s.inflight < max)?;
        let mut slot = self.rotation.remove(pos)?;
        slot.inflight += 1;
        let route = slot.route.clone();
        self.rotation.push_back(slot);
        Some(route)
    }

    fn flush(&mut self) -> Vec<(Route, ConnectionEvent<P>)> {
        let mut assigned = Vec::new();
        while !self.queue.is_empty() {
            let Some(route) = self.pick() else {
                break;
            };
            if let Some(event) = self.queue.pop_front() {
                assigned.push((route, event));
            }
        }
        assigned
    }
}
