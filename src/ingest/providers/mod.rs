pub mod fixture;
pub mod telegram;
