pub mod concretetensor;

pub use concretetensor::Tensor;
