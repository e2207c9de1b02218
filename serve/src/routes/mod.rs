pub mod agents;
pub mod events;
pub mod files;
pub mod health;
pub mod terminal;
