#![no_main]

use libfuzzer_sys::fuzz_target;
use suede::{Role, Session};

mod shared;
use shared::{NullWrite, RUNTIME};

fuzz_target!(|data: &[u8]| {
    RUNTIME.with(|runtime| {
        runtime.borrow_mut().block_on(async {
            let (session, reader) = Session::from_raw_parts(data, NullWrite, Role::Server, None);
            session.run(reader, &()).await.ok();
        });
    });
});
