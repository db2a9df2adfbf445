// Keeps every module crate linked so its registrations reach inventory.
// Add a line here for each crate under ./modules.
#![allow(unused_imports)]

use sample_modules as _;
