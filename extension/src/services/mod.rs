pub mod activity;
pub mod browser;
pub mod gateway;
pub mod keystore;
pub mod storage;

pub use activity::{ActivityEntry, ActivityLog, MemoryActivityLog, TracingActivityLog};
pub use browser::{Browser, SimulatedBrowser, Tab, WindowEvent};
pub use gateway::{Gateway, GatewayConfig, MemoryGateway};
pub use keystore::{DevKeystore, Keystore, KeystoreChange, WalletInfo, WalletKind};
pub use storage::{Allowance, AppSettings, MemoryStore, PermissionCheck, PermissionStore, StoreChange, Winston};
