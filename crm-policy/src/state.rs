//! Per-container placement state machine (spec.md §4.4.6).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementPhase {
    New,
    Classified,
    Placed,
    Enforced,
    Live,
    Adjusted,
    Released,
}

impl PlacementPhase {
    /// Whether a transition from `self` to `to` is legal. `Live` and
    /// `Adjusted` loop back to each other any number of times before the
    /// container is finally `Released`. `Placed` and `Enforced` can also
    /// reach `Adjusted` directly: an adjustment (CRI `UpdateContainerResources`
    /// or an agent `SetAdjustment`) can arrive before the server has driven a
    /// container all the way to `Live`.
    pub fn can_transition(self, to: PlacementPhase) -> bool {
        use PlacementPhase::*;
        matches!(
            (self, to),
            (New, Classified)
                | (Classified, Placed)
                | (Placed, Enforced)
                | (Enforced, Live)
                | (Placed, Adjusted)
                | (Enforced, Adjusted)
                | (Live, Adjusted)
                | (Adjusted, Live)
                | (Live, Released)
                | (Adjusted, Released)
                | (Enforced, Released)
                | (Placed, Released)
                | (Classified, Released)
                | (New, Released)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PlacementPhase::*;

    #[test]
    fn happy_path_is_linear_then_loops() {
        assert!(New.can_transition(Classified));
        assert!(Classified.can_transition(Placed));
        assert!(Placed.can_transition(Enforced));
        assert!(Enforced.can_transition(Live));
        assert!(Live.can_transition(Adjusted));
        assert!(Adjusted.can_transition(Live));
        assert!(Live.can_transition(Released));
    }

    #[test]
    fn cannot_skip_phases_forward() {
        assert!(!New.can_transition(Enforced));
        assert!(!Classified.can_transition(Live));
    }

    #[test]
    fn adjusted_is_reachable_before_live() {
        assert!(Placed.can_transition(Adjusted));
        assert!(Enforced.can_transition(Adjusted));
    }

    #[test]
    fn released_is_terminal() {
        assert!(!Released.can_transition(Live));
        assert!(!Released.can_transition(Adjusted));
    }
}
