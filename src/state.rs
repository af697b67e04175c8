// state.rs - Tuple lifecycle states

/// Lifecycle state of a tuple in the network.
///
/// Tracks whether a tuple is being created, is stable, is being updated, or
/// is on its way out of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleState {
    /// Tuple was produced this batch and has not been propagated yet
    Creating,
    /// Tuple is stable and visible downstream
    Ok,
    /// Tuple changed this batch; downstream will see an update
    Updating,
    /// Tuple was visible downstream and is being removed
    Dying,
    /// Tuple creation was cancelled before anything downstream saw it
    Aborting,
    /// Tuple is dead and its storage can be reclaimed
    Dead,
}

impl TupleState {
    /// True while the tuple sits in a propagation queue awaiting a drain.
    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            TupleState::Creating | TupleState::Updating | TupleState::Dying | TupleState::Aborting
        )
    }

}

impl Default for TupleState {
    fn default() -> Self {
        TupleState::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_states() {
        assert!(TupleState::Creating.is_dirty());
        assert!(TupleState::Updating.is_dirty());
        assert!(TupleState::Dying.is_dirty());
        assert!(TupleState::Aborting.is_dirty());
        assert!(!TupleState::Ok.is_dirty());
        assert!(!TupleState::Dead.is_dirty());
    }
}
