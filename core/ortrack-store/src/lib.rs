//! SQLite-backed [`Catalog`] and [`SessionStore`] for ortrack.
//!
//! One database file holds everything: the catalog imported from a JSON seed
//! (see [`load_seed`]) and the verification and outbound records the engine
//! writes. Schema is created on [`Db::new`] and older files are migrated in
//! place.
//!
//! [`Catalog`]: ortrack_core::Catalog
//! [`SessionStore`]: ortrack_core::SessionStore

mod db;
mod seed;

pub use db::Db;
pub use seed::{
    load_seed, CatalogSeed, ImportSummary, ItemSeed, OperationSessionSeed, OperationTypeSeed,
    TagSeed,
};
