//! FaunaGuard - wildlife hazard management for airports.
//!
//! # Overview
//!
//! FaunaGuard records wildlife strikes, sightings, aircraft movements,
//! control actions, carcass findings, trainings and inspections for a set of
//! airports, and turns strike records into financial and KPI reports.
//!
//! Every user belongs to one airport and only sees that airport's data,
//! except administrators, who see all of them.
//!
//! # Modules
//!
//! - [`api`]: HTTP handlers and router
//! - [`auth`]: Bearer-token verification, roles and airport scoping
//! - [`config`]: Environment configuration
//! - [`error`]: Error type and its HTTP mapping
//! - [`model`]: Strike, report and KPI types
//! - [`patch`]: Allow-listed INSERT/UPDATE construction
//! - [`resources`]: Registry of the generic CRUD tables
//! - [`storage`]: SQLite storage layer
//! - [`inspection`]: Inspections with checklist items and sections
//! - [`aggregation`]: Financial dataset and KPI computation

pub mod aggregation;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod inspection;
pub mod model;
pub mod patch;
pub mod resources;
pub mod storage;
