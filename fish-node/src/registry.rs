//! Process-wide driver factories. The lists are fixed at first access and
//! only reachable through the accessors below; there is no dynamic
//! unloading.

use crate::{
    drivers::{self, ResourceDriver},
    gates::{self, GateDriver},
};
use once_cell::sync::Lazy;

pub trait ResourceDriverFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self) -> Box<dyn ResourceDriver>;
}

pub trait GateDriverFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self) -> Box<dyn GateDriver>;
}

static RESOURCE_FACTORIES: Lazy<Vec<Box<dyn ResourceDriverFactory>>> =
    Lazy::new(|| vec![Box::new(drivers::native::Factory), Box::new(drivers::test::Factory)]);

static GATE_FACTORIES: Lazy<Vec<Box<dyn GateDriverFactory>>> =
    Lazy::new(|| vec![Box::new(gates::github::Factory)]);

pub fn resource_driver_names() -> Vec<&'static str> {
    RESOURCE_FACTORIES.iter().map(|f| f.name()).collect()
}

pub fn gate_driver_names() -> Vec<&'static str> {
    GATE_FACTORIES.iter().map(|f| f.name()).collect()
}

/// Builds a fresh, unprepared instance of the named resource driver.
pub fn resource_driver(name: &str) -> Option<Box<dyn ResourceDriver>> {
    RESOURCE_FACTORIES.iter().find(|f| f.name() == name).map(|f| f.build())
}

/// Builds a fresh, unprepared instance of the named gate driver.
pub fn gate_driver(name: &str) -> Option<Box<dyn GateDriver>> {
    GATE_FACTORIES.iter().find(|f| f.name() == name).map(|f| f.build())
}
