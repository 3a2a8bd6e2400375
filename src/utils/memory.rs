//! Memory management utilities.

/// Return freed memory to the OS.
///
/// Called after an offloaded layer's device copy is dropped.
pub fn clean_memory() {
    #[cfg(target_os = "linux")]
    {
        // glibc keeps freed arenas around unless asked
        unsafe extern "C" {
            fn malloc_trim(pad: usize) -> i32;
        }
        unsafe {
            malloc_trim(0);
        }
    }

    #[cfg(feature = "cuda")]
    {
        // dropping the tensors frees the CUDA buffers
        tracing::trace!("Memory cleanup requested (CUDA)");
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
