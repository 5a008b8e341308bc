use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Run `f`, catching a panic so one bad callback cannot take the loop down.
/// Returns false if `f` panicked.
pub(crate) fn run_isolated(what: &'static str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(
                message = "callback panicked",
                what,
                panic = panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_normal_closure() {
        let mut hit = false;
        assert!(run_isolated("test", || hit = true));
        assert!(hit);
    }

    #[test]
    fn contains_panic() {
        assert!(!run_isolated("test", || panic!("boom")));
    }

    #[test]
    fn extracts_payload_text() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("static");
        let other: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "static");
        assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
    }
}
