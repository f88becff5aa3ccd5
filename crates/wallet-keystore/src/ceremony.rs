//! Hardware-sign interaction state machine.
//!
//! Signing with an authenticator-held key needs a short dialogue with the
//! user. The machine below only consumes events and emits steps; prompting and
//! calling the authenticator happen in the driver (see `signer.rs`).
//!
//! ```text
//! Intro --ok|retry--> WebauthnBegin --ok--> [assertion]
//!   [assertion] --signed--> Success --ok--> Complete(signature)
//!   [assertion] --failed--> Error --retry--> WebauthnBegin
//!   [assertion] --no sig--> SignatureNotFound --retry--> WebauthnBegin
//! any --cancel--> Abort(CanceledByUser)
//! ```

use crate::error::KeystoreError;
use async_trait::async_trait;

/// What the UI is asked to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignPrompt {
    Intro,
    WebauthnBegin,
    Success,
    Error(String),
    SignatureNotFound,
}

impl SignPrompt {
    /// Stable event name for UI bindings.
    pub fn name(&self) -> &'static str {
        match self {
            SignPrompt::Intro => "intro",
            SignPrompt::WebauthnBegin => "webauthn-begin",
            SignPrompt::Success => "success",
            SignPrompt::Error(_) => "err",
            SignPrompt::SignatureNotFound => "err:ext:sign:signature-not-found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserResponse {
    Ok,
    Retry,
    Cancel,
}

#[derive(Debug)]
pub enum CeremonyEvent {
    Start,
    User(UserResponse),
    Signed(Vec<u8>),
    AssertionFailed(String),
    SignatureMissing,
}

#[derive(Debug)]
pub enum CeremonyStep {
    Render(SignPrompt),
    RequestAssertion,
    Complete(Vec<u8>),
    Abort(KeystoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Intro,
    WebauthnBegin,
    AwaitingAssertion,
    Success(Vec<u8>),
    Error(String),
    SignatureNotFound,
    Finished,
}

#[derive(Debug)]
pub struct SignCeremony {
    state: State,
}

impl Default for SignCeremony {
    fn default() -> Self {
        Self::new()
    }
}

impl SignCeremony {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn step(&mut self, event: CeremonyEvent) -> CeremonyStep {
        use CeremonyEvent as E;
        use UserResponse as U;

        if matches!(event, E::User(U::Cancel)) {
            self.state = State::Finished;
            return CeremonyStep::Abort(KeystoreError::CanceledByUser);
        }

        let state = std::mem::replace(&mut self.state, State::Finished);
        let (next, step) = match (state, event) {
            (State::Idle, E::Start) => (State::Intro, CeremonyStep::Render(SignPrompt::Intro)),
            (State::Intro, E::User(U::Ok | U::Retry))
            | (State::Error(_), E::User(U::Retry))
            | (State::SignatureNotFound, E::User(U::Retry)) => (
                State::WebauthnBegin,
                CeremonyStep::Render(SignPrompt::WebauthnBegin),
            ),
            (State::WebauthnBegin, E::User(U::Ok)) => {
                (State::AwaitingAssertion, CeremonyStep::RequestAssertion)
            }
            (State::AwaitingAssertion, E::Signed(sig)) => {
                (State::Success(sig), CeremonyStep::Render(SignPrompt::Success))
            }
            (State::AwaitingAssertion, E::AssertionFailed(msg)) => (
                State::Error(msg.clone()),
                CeremonyStep::Render(SignPrompt::Error(msg)),
            ),
            (State::AwaitingAssertion, E::SignatureMissing) => (
                State::SignatureNotFound,
                CeremonyStep::Render(SignPrompt::SignatureNotFound),
            ),
            (State::Success(sig), E::User(U::Ok)) => (State::Finished, CeremonyStep::Complete(sig)),
            (State::Error(msg), E::User(U::Ok)) => (
                State::Finished,
                CeremonyStep::Abort(KeystoreError::Authenticator(msg)),
            ),
            (State::SignatureNotFound, E::User(U::Ok)) => (
                State::Finished,
                CeremonyStep::Abort(KeystoreError::SignatureNotFound),
            ),
            (state, event) => (
                State::Finished,
                CeremonyStep::Abort(KeystoreError::Signing(format!(
                    "unexpected {:?} in state {:?}",
                    event, state
                ))),
            ),
        };
        self.state = next;
        step
    }
}

/// Renders ceremony prompts and collects the user's answer.
#[async_trait]
pub trait SignInteraction: Send + Sync {
    async fn render(&self, prompt: &SignPrompt) -> UserResponse;
}

/// Confirms every prompt. For headless use where consent was already given.
pub struct AutoConfirm;

#[async_trait]
impl SignInteraction for AutoConfirm {
    async fn render(&self, _prompt: &SignPrompt) -> UserResponse {
        UserResponse::Ok
    }
}
