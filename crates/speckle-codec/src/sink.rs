use speckle_types::Fragment;

use crate::error::SerializeResult;

/// Receiver of fragments as the serializer emits them.
///
/// Fragments arrive children first: every fragment only references fragments
/// delivered before it. The root comes last. An error from `accept` aborts the
/// serialization.
pub trait FragmentSink {
    fn accept(&mut self, fragment: Fragment) -> SerializeResult<()>;
}

impl FragmentSink for Vec<Fragment> {
    fn accept(&mut self, fragment: Fragment) -> SerializeResult<()> {
        self.push(fragment);
        Ok(())
    }
}

/// Adapter turning a closure into a [`FragmentSink`].
pub struct FnSink<F>(pub F);

impl<F> FragmentSink for FnSink<F>
where
    F: FnMut(Fragment) -> SerializeResult<()>,
{
    fn accept(&mut self, fragment: Fragment) -> SerializeResult<()> {
        (self.0)(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SerializeError;
    use speckle_types::ObjectId;

    #[test]
    fn vec_collects() {
        let mut sink = Vec::new();
        sink.accept(Fragment::new(ObjectId::null(), "{}", "Base")).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn fn_sink_forwards_errors() {
        let mut sink = FnSink(|_f: Fragment| -> crate::error::SerializeResult<()> { Err(SerializeError::Canceled) });
        assert!(matches!(
            sink.accept(Fragment::new(ObjectId::null(), "{}", "Base")),
            Err(SerializeError::Canceled)
        ));
    }
}
