//! A customer manager built on a two-phase commit [`tc_txn::Coordinator`].

pub mod customer;

pub use customer::{Customer, CustomerManager};
