mod category;
pub use category::*;
mod compression;
pub use compression::*;
mod operation;
pub use operation::*;
mod package;
pub use package::*;
mod settings;
pub use settings::*;
