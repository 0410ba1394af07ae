//! Presenter role tracking.
//!
//! The presenter is the one participant whose ephemeral UI state (cursor,
//! selection) is broadcast. It defaults to the session host and moves only
//! through the request/approve/deny/change protocol — all serialized by the
//! hub, so this module is plain state + transitions with no locking.

/// Current presenter/host identities for one session.
#[derive(Debug, Clone)]
pub struct PresenterState {
    host_user_id: String,
    presenter_user_id: String,
}

/// What the hub must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterEffect {
    /// Broadcast `current_presenter` with the new presenter id.
    Announce,
    /// Forward the request to the host's connections.
    ForwardRequestToHost,
    /// Forward the denial to the requester's connections.
    ForwardDenyToRequester,
    /// Nothing to do (invalid or vacuous transition; dropped silently).
    None,
}

impl PresenterState {
    /// The host is the first user to open the session; it is immutable and
    /// starts out as the presenter.
    pub fn new(host_user_id: String) -> Self {
        Self {
            presenter_user_id: host_user_id.clone(),
            host_user_id,
        }
    }

    pub fn host(&self) -> &str {
        &self.host_user_id
    }

    pub fn presenter(&self) -> &str {
        &self.presenter_user_id
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_user_id == user_id
    }

    pub fn is_presenter(&self, user_id: &str) -> bool {
        self.presenter_user_id == user_id
    }

    /// A participant asks for the presenter role. The host reclaims it
    /// directly; anyone else is forwarded to the host for a decision.
    pub fn request(&mut self, requester_user_id: &str) -> PresenterEffect {
        if self.is_host(requester_user_id) {
            self.presenter_user_id = self.host_user_id.clone();
            PresenterEffect::Announce
        } else {
            PresenterEffect::ForwardRequestToHost
        }
    }

    /// Host grants a pending request. `requester_connected` is checked by the
    /// hub against the live participant set; a requester who left in the
    /// meantime is dropped silently.
    pub fn approve(&mut self, requester_user_id: &str, requester_connected: bool) -> PresenterEffect {
        if !requester_connected {
            return PresenterEffect::None;
        }
        self.presenter_user_id = requester_user_id.to_string();
        PresenterEffect::Announce
    }

    /// Host refuses a pending request.
    pub fn deny(&self) -> PresenterEffect {
        PresenterEffect::ForwardDenyToRequester
    }

    /// Host force-assigns the presenter. Assigning the host's own id always
    /// works (the host may be reclaiming after a handoff); anyone else must
    /// be connected.
    pub fn change(&mut self, target_user_id: &str, target_connected: bool) -> PresenterEffect {
        if self.is_host(target_user_id) {
            self.presenter_user_id = self.host_user_id.clone();
            return PresenterEffect::Announce;
        }
        if !target_connected {
            return PresenterEffect::None;
        }
        self.presenter_user_id = target_user_id.to_string();
        PresenterEffect::Announce
    }

    /// A user's last connection closed. The presenter role reverts to the
    /// host when the presenter leaves; the host identity itself never
    /// changes, even while the host is offline.
    pub fn on_user_gone(&mut self, user_id: &str) -> PresenterEffect {
        if self.is_presenter(user_id) && !self.is_host(user_id) {
            self.presenter_user_id = self.host_user_id.clone();
            PresenterEffect::Announce
        } else {
            PresenterEffect::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_starts_as_presenter() {
        let state = PresenterState::new("host".into());
        assert!(state.is_presenter("host"));
        assert_eq!(state.presenter(), "host");
    }

    #[test]
    fn non_host_request_is_forwarded() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.request("bob"), PresenterEffect::ForwardRequestToHost);
        // The role does not move until the host approves.
        assert!(state.is_presenter("host"));
    }

    #[test]
    fn approval_moves_the_role() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.approve("bob", true), PresenterEffect::Announce);
        assert!(state.is_presenter("bob"));
    }

    #[test]
    fn approval_of_departed_requester_is_dropped() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.approve("bob", false), PresenterEffect::None);
        assert!(state.is_presenter("host"));
    }

    #[test]
    fn denial_is_forwarded_without_moving_the_role() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.request("bob"), PresenterEffect::ForwardRequestToHost);
        assert_eq!(state.deny(), PresenterEffect::ForwardDenyToRequester);
        assert!(state.is_presenter("host"));
    }

    #[test]
    fn host_request_reclaims_directly() {
        let mut state = PresenterState::new("host".into());
        state.approve("bob", true);
        assert_eq!(state.request("host"), PresenterEffect::Announce);
        assert!(state.is_presenter("host"));
    }

    #[test]
    fn change_assigns_or_reclaims() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.change("bob", true), PresenterEffect::Announce);
        assert!(state.is_presenter("bob"));
        assert_eq!(state.change("host", false), PresenterEffect::Announce);
        assert!(state.is_presenter("host"));
        assert_eq!(state.change("carol", false), PresenterEffect::None);
    }

    #[test]
    fn presenter_disconnect_reverts_to_host() {
        let mut state = PresenterState::new("host".into());
        state.approve("bob", true);
        assert_eq!(state.on_user_gone("bob"), PresenterEffect::Announce);
        assert!(state.is_presenter("host"));
    }

    #[test]
    fn host_disconnect_leaves_presenter_alone() {
        let mut state = PresenterState::new("host".into());
        state.approve("bob", true);
        // Host going offline does not move the role away from bob.
        assert_eq!(state.on_user_gone("host"), PresenterEffect::None);
        assert!(state.is_presenter("bob"));
    }

    #[test]
    fn non_presenter_disconnect_is_a_no_op() {
        let mut state = PresenterState::new("host".into());
        assert_eq!(state.on_user_gone("carol"), PresenterEffect::None);
        assert!(state.is_presenter("host"));
    }
}
