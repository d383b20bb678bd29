pub mod browser;
pub mod credentials;
pub mod session;

// --- Primary exports ---
pub use browser::{BrowserError, BrowserFactory, BrowserHandle};
pub use credentials::CredentialStore;
pub use session::detector::{Challenge, ChallengeDetector, ChallengeObservation, Confidence};
pub use session::machine::SessionStateMachine;
pub use session::resolver::{ChallengeResolver, ResolveOutcome};
pub use session::store::{SessionStore, SessionToken};
pub use session::{SessionConfig, SiteProfile};
