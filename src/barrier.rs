use super::*;

/// Reusable rendezvous point for a fixed number of participants.
///
/// Each release bumps the generation so a waiter only wakes for the round it
/// arrived in, even if the barrier is immediately reused.
#[derive(Debug)]
pub struct SimpleBarrier {
    participants: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl SimpleBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            participants: participants.max(1),
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    pub fn generation(&self) -> Result<u64, CozipOffloadError> {
        Ok(lock(&self.state)?.generation)
    }

    /// Blocks until every participant has arrived. Returns `true` on the
    /// thread that completed the round.
    pub fn arrive_and_wait(&self) -> Result<bool, CozipOffloadError> {
        let mut state = lock(&self.state)?;
        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(true);
        }

        while state.generation == generation {
            state = self
                .released
                .wait(state)
                .map_err(|_| CozipOffloadError::Internal("barrier mutex poisoned"))?;
        }
        Ok(false)
    }
}
