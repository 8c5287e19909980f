pub mod bootstrap;
pub mod foundation;
pub mod layout;
pub mod registry;
