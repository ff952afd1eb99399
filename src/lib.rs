pub mod checkpoint;
pub mod config;
pub mod crm;
pub mod db;
pub mod differ;
pub mod lock;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod runner;
pub mod stage;
