pub mod instrument;
pub mod order;
pub mod portfolio;
