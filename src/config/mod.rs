//! Layered stack configuration
//!
//! Settings resolve from built-in defaults, then the project `.env` file,
//! then the process environment. The resolved variables feed both the typed
//! [`StackSettings`] and manifest interpolation.

pub mod interpolate;
pub mod settings;

pub use interpolate::Interpolator;
pub use settings::{
    BasicAuthSettings, DatabaseSettings, ExternalUrl, SettingsLoader, StackSettings, Variables,
    VariableSource,
};
