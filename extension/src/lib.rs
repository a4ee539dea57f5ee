// Arweave wallet extension core
// Cross-context messaging between the page, content scripts, the background
// and authorization popups, with the wallet API on top of it.

pub mod app;
pub mod auth;
pub mod background;
pub mod bus;
pub mod chunks;
pub mod config;
pub mod content;
pub mod foreground;
pub mod protocol;
pub mod services;
pub mod transaction;
pub mod window;

pub use app::{AppUrl, Application};
pub use background::{Background, Services};
pub use bus::{BusError, Context, Destination, MessageBus};
pub use content::ContentScript;
pub use foreground::WalletApi;
pub use window::PageWindow;
