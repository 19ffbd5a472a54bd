pub mod interp;
pub mod logging;
pub mod tast;
