//! Lifecycle of the process-wide registry.
//!
//! Everything runs inside one test, since the global registry cannot be
//! brought back once it has been shut down.
#![cfg(not(loom))]
#![feature(allocator_api)]

use std::alloc::AllocError;

use tracked_ptr::{
    make_tracked, make_tracked_with, shutdown_global, Error, Registry, RegistryConfig, TrackedPtr,
};

#[derive(Debug, PartialEq)]
enum DriverError {
    Tracking(Error),
    Empty,
}

impl From<AllocError> for DriverError {
    fn from(err: AllocError) -> Self {
        DriverError::Tracking(err.into())
    }
}

impl From<Error> for DriverError {
    fn from(err: Error) -> Self {
        DriverError::Tracking(err)
    }
}

fn non_empty(text: &str) -> Result<String, DriverError> {
    if text.is_empty() {
        Err(DriverError::Empty)
    } else {
        Ok(text.to_owned())
    }
}

#[test]
fn global_lifecycle() {
    let config = RegistryConfig::default();
    let global = Registry::init_global(config);
    assert!(Registry::ptr_eq(global, Registry::global()));
    assert!(Registry::ptr_eq(global, Registry::init_global(config)));
    assert_eq!(global.live_count(), 0);

    // Five tracked pointers, one extra copy, then everything dropped.
    {
        let mut vec = Vec::new();
        vec.push(make_tracked(String::from("Hello World")).unwrap());
        let c = make_tracked("c".repeat(17)).unwrap();
        vec.push(c.clone());
        vec.push(make_tracked(String::from("End of the world as we know it!")).unwrap());
        vec.push(make_tracked(String::from("THIS IS SPARTA")).unwrap());
        let empty = make_tracked(std::cell::RefCell::new(String::new())).unwrap();
        *empty.borrow_mut() += "this string was created empty";
        assert_eq!(global.live_count(), 5);

        let copy = vec[0].clone();
        assert_eq!(global.live_count(), 5);
        assert_eq!(*copy, "Hello World");
        assert_eq!(*c, "ccccccccccccccccc");
        assert_eq!(*empty.borrow(), "this string was created empty");

        for ptr in vec.iter().cloned() {
            assert!(TrackedPtr::token_id(&ptr).is_some());
        }
    }
    assert_eq!(global.live_count(), 0);

    assert_eq!(
        make_tracked_with(|| non_empty("")).unwrap_err(),
        DriverError::Empty
    );
    assert_eq!(global.live_count(), 0);

    let kept = make_tracked_with(|| non_empty("kept until exit")).unwrap();
    assert_eq!(global.live_count(), 1);

    let report = shutdown_global();
    assert!(!report.already_finalized);
    assert_eq!(report.cleared.len(), 1);
    assert_eq!(report.cleared[0].type_name, std::any::type_name::<String>());
    assert_eq!(report.cleared[0].location.file(), file!());
    assert_eq!(global.live_count(), 0);
    assert!(global.is_finalized());

    assert_eq!(make_tracked(1_u8).unwrap_err(), Error::RegistryFinalized);
    assert_eq!(
        make_tracked_with(|| non_empty("late")).unwrap_err(),
        DriverError::Tracking(Error::RegistryFinalized)
    );

    assert_eq!(*kept, "kept until exit");
    drop(kept);
    assert_eq!(global.live_count(), 0);

    let again = shutdown_global();
    assert!(again.already_finalized);
    assert!(again.is_clean());
}
