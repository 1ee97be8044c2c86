pub mod feedback;
pub mod instructions;

pub use feedback::*;
pub use instructions::*;
