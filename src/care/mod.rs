pub mod prober;
mod reconciler;
mod session;


pub use prober::{HttpProber, Prober};
pub use reconciler::Reconciler;
pub use session::SessionController;
