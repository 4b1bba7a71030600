pub mod flag_route;

pub use flag_route::FlagRouteTool;
