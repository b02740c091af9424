#[cfg(test)]
pub mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::{
        buffer::aligned::AlignedBuf,
        storage::disk::{
            file::{DiskFile, FileBackend},
            registry::DiskRegistry,
            request::{wait_any, Request, RequestKind, RequestState},
        },
        tests::support::GateFile,
        utils::stats::Stats,
    };

    #[test]
    fn cancel_pending_request_test() {
        let gate = Arc::new(GateFile::new("gate-cancel", 0));
        let registry = Arc::new(DiskRegistry::new());
        let file = DiskFile::new(Arc::clone(&gate) as Arc<dyn FileBackend>, Arc::clone(&registry));

        let in_service = file.aread(AlignedBuf::new(32), 0, 32).unwrap();
        gate.wait_entered(1);

        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let doomed = Request::new(
            Arc::clone(&gate) as Arc<dyn FileBackend>,
            RequestKind::Write,
            AlignedBuf::filled(32, 1),
            64,
            32,
        )
        .unwrap()
        .with_callback(move |_, ok| {
            if !ok {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        let doomed = file.submit(doomed).unwrap();
        let survivor = file.aread(AlignedBuf::new(32), 128, 32).unwrap();

        let before = Stats::global().snapshot();
        assert!(file.cancel(&doomed));
        // Already handed to the worker.
        assert!(!file.cancel(&in_service));
        // Already canceled.
        assert!(!registry.cancel(&doomed));
        assert!(Stats::global().snapshot().cancels > before.cancels);

        assert_eq!(RequestState::Canceled, doomed.state());
        assert!(doomed.wait().unwrap_err().is_canceled());
        assert_eq!(1, failures.load(Ordering::SeqCst));
        // The buffer comes back untouched.
        assert!(doomed.take_buffer().unwrap().iter().all(|&b| b == 1));

        gate.open();
        in_service.wait().unwrap();
        survivor.wait().unwrap();

        // The canceled write never reached the backend.
        assert!(gate.served().iter().all(|&(_, offset)| offset != 64));
    }

    #[test]
    fn cancel_all_test() {
        let gate = Arc::new(GateFile::new("gate-cancel-all", 0));
        let registry = Arc::new(DiskRegistry::new());
        let file = DiskFile::new(Arc::clone(&gate) as Arc<dyn FileBackend>, Arc::clone(&registry));

        let first = file.aread(AlignedBuf::new(8), 0, 8).unwrap();
        gate.wait_entered(1);
        let rest: Vec<Arc<Request>> = (1..5)
            .map(|i| file.aread(AlignedBuf::new(8), i * 8, 8).unwrap())
            .collect();

        assert_eq!(4, registry.cancel_all(&rest));
        assert_eq!(Some(0), wait_any(&rest));

        gate.open();
        first.wait().unwrap();
        assert_eq!(1, gate.served().len());
    }

    #[test]
    fn cancel_unknown_queue_test() {
        let file: Arc<dyn FileBackend> = Arc::new(GateFile::new("never-routed", 42));
        let request = Arc::new(
            Request::new(file, RequestKind::Read, AlignedBuf::new(8), 0, 8).unwrap(),
        );
        let registry = DiskRegistry::new();
        assert!(!registry.cancel(&request));
        assert_eq!(RequestState::Pending, request.state());
    }
}
