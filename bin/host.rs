mod cdp;
mod chromium;
mod tab;

pub use chromium::*;
