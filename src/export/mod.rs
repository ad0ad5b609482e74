pub mod health;
pub mod run_stats;
