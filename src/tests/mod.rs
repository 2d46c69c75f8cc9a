use std::path::Path;

use crate::{config::Config, session::Session};

mod config;
mod lang;
mod pattern;
mod prepare;
mod scheduler;
mod tree;

pub(crate) fn session() -> Session {
    Session::new(Config::default()).unwrap()
}

pub(crate) fn transpile(source: &str) -> (String, Session) {
    let session = session();
    let output = session
        .transpile_source(source, Path::new("test.cup"))
        .unwrap();
    (output, session)
}
