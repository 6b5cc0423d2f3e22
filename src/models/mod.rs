pub mod relay_model;
