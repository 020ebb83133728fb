//! Domain types shared by every service.

pub mod actor;
pub mod audit;
pub mod currency;
pub mod expense;
pub mod group;
pub mod ids;
pub mod ledger;
pub mod notification;
pub mod settlement;
