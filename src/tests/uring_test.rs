#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use crate::{
        buffer::aligned::AlignedBuf,
        storage::disk::{
            file::{DiskFile, FileBackend, FileOptions, SyscallFile},
            registry::DiskRegistry,
            request::{wait_all, RequestState},
        },
    };

    fn native_file(dir: &tempfile::TempDir) -> (DiskFile, Arc<DiskRegistry>) {
        let options = FileOptions {
            native_async: true,
            ..FileOptions::default()
        };
        let backend: Arc<dyn FileBackend> =
            Arc::new(SyscallFile::open(dir.path().join("uring"), options, 0, 0).unwrap());
        let registry = Arc::new(DiskRegistry::new());
        (DiskFile::new(backend, Arc::clone(&registry)), registry)
    }

    // Rings may be unavailable (old kernels, seccomp); the registry then falls
    // back to a threaded queue and the same behavior must hold.
    #[test]
    fn uring_round_trip_test() {
        let dir = tempfile::tempdir().unwrap();
        let (file, registry) = native_file(&dir);
        assert_eq!("uring", file.backend().io_type());

        let writes: Vec<_> = (0..16u64)
            .map(|i| file.awrite(AlignedBuf::filled(4096, i as u8), i * 4096, 4096).unwrap())
            .collect();
        wait_all(&writes).unwrap();
        assert!(writes.iter().all(|w| w.state() == RequestState::Done));

        assert_eq!(1, registry.len());
        assert_eq!(0, registry.queue(0).unwrap().id());

        for i in 0..16u64 {
            let read = file.aread(AlignedBuf::new(4096), i * 4096, 4096).unwrap();
            read.wait().unwrap();
            assert!(read.take_buffer().unwrap().iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn uring_short_read_zero_fills_test() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _registry) = native_file(&dir);

        file.awrite(AlignedBuf::filled(1000, 0x5a), 0, 1000)
            .unwrap()
            .wait()
            .unwrap();
        let read = file.aread(AlignedBuf::filled(4096, 0xff), 0, 4096).unwrap();
        read.wait().unwrap();

        let buf = read.take_buffer().unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 0x5a));
        assert!(buf[1000..].iter().all(|&b| b == 0));
    }
}
