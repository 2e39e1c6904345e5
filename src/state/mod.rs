mod app_state;
mod auth_state;
mod secret_manager;

pub use app_state::EpdeClient;
pub use auth_state::AuthState;
pub use secret_manager::{
    KeyringBackend, MemoryBackend, SecretBackend, TokenStore, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN,
};
