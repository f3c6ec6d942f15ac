// Scoring pipeline modules and shared errors/models
pub mod artifact {
    pub use crate::artifact::*;
}

pub mod features {
    pub use crate::features::*;
}

pub mod inference {
    pub use crate::inference::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
