mod executor;

pub use executor::{
    ConnectionInfo, RentalError, RentalExecutor, RentalSession, StartRentalRequest,
};
