//! Chrome DevTools Protocol backend for browser tasks: one fresh browser
//! process and profile per session.

pub mod cdp;
pub mod driver;
pub(crate) mod guard;
pub mod session;

pub use driver::CdpDriver;
pub use session::{find_browser_binary, BrowserEngine, CdpLauncher};
