pub mod check_generation;
pub mod health;
