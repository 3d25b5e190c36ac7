mod adaptor;
mod forwarder;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use adaptor::*;
pub use forwarder::*;
