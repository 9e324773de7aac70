use crate::common::{OpModelId, StreamId};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A loaded executor for one compiled operator, bound to one stream.
pub trait ModelExecutor: Send + Sync + Debug {
    fn op_model_id(&self) -> OpModelId;
    fn stream(&self) -> StreamId;
}

/// The stream-bound executors of one cached operator.
#[derive(Debug, Default)]
pub struct StreamExecutor {
    executors: Mutex<HashMap<StreamId, Arc<dyn ModelExecutor>>>,
}

impl StreamExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: StreamId) -> Option<Arc<dyn ModelExecutor>> {
        self.executors.lock().get(&stream).cloned()
    }

    /// Returns the executor bound to `stream`, calling `create` to build one if there is none.
    ///
    /// The lock is not held while `create` runs. If another executor was bound to `stream` in
    /// the meantime, that one is kept and returned.
    pub fn get_or_create<F, E>(&self, stream: StreamId, create: F) -> Result<Arc<dyn ModelExecutor>, E>
    where
        F: FnOnce() -> Result<Arc<dyn ModelExecutor>, E>,
    {
        if let Some(existing) = self.get(stream) {
            return Ok(existing);
        }
        let created = create()?;
        Ok(Arc::clone(
            self.executors.lock().entry(stream).or_insert(created),
        ))
    }

    /// Unbinds `stream`. Returns whether an executor was bound.
    pub fn erase(&self, stream: StreamId) -> bool {
        self.executors.lock().remove(&stream).is_some()
    }

    pub fn len(&self) -> usize {
        self.executors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.lock().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct FakeExecutor {
        pub(crate) op_model_id: OpModelId,
        pub(crate) stream: StreamId,
    }

    impl ModelExecutor for FakeExecutor {
        fn op_model_id(&self) -> OpModelId {
            self.op_model_id
        }

        fn stream(&self) -> StreamId {
            self.stream
        }
    }

    pub(crate) fn fake(op_model_id: OpModelId, stream: StreamId) -> Arc<dyn ModelExecutor> {
        Arc::new(FakeExecutor {
            op_model_id,
            stream,
        })
    }

    #[test]
    fn test_get_or_create_builds_once_per_stream() {
        let se = StreamExecutor::new();
        let mut calls = 0;
        for _ in 0..3 {
            let exe = se
                .get_or_create::<_, ()>(StreamId(1), || {
                    calls += 1;
                    Ok(fake(7, StreamId(1)))
                })
                .unwrap();
            assert_eq!(exe.stream(), StreamId(1));
        }
        assert_eq!(calls, 1);
        se.get_or_create::<_, ()>(StreamId(2), || Ok(fake(7, StreamId(2))))
            .unwrap();
        assert_eq!(se.len(), 2);
    }

    #[test]
    fn test_failed_create_binds_nothing() {
        let se = StreamExecutor::new();
        let err = se
            .get_or_create(StreamId(3), || Err("no device memory"))
            .unwrap_err();
        assert_eq!(err, "no device memory");
        assert!(se.is_empty());
        assert!(se.get(StreamId(3)).is_none());
    }

    #[test]
    fn test_erase_unbinds_stream() {
        let se = StreamExecutor::new();
        se.get_or_create::<_, ()>(StreamId(4), || Ok(fake(1, StreamId(4))))
            .unwrap();
        assert!(se.erase(StreamId(4)));
        assert!(!se.erase(StreamId(4)));
        assert!(se.is_empty());
    }
}
