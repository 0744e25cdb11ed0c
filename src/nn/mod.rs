pub mod backend;
pub mod blas;
pub mod error;
pub mod network;
pub mod planes;
pub mod selfcheck;
pub mod weights;
pub mod winograd;

pub use backend::Backend;
pub use backend::Cpu;
pub use error::EvaluatorError;
pub use error::LoadError;
pub use network::Network;
pub use network::NetworkOutput;
pub use planes::Plane;
pub use selfcheck::SelfCheck;
pub use weights::Weights;
