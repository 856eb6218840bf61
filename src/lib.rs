pub mod concurrent_index;
pub mod config;
pub mod skip_list;

pub use skip_list::SkipList;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        extern crate tikv_jemallocator;

        #[global_allocator]
        static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

        pub struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }

        impl MemSampler {
            pub fn new() -> Self {
                MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib().unwrap(),
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib().unwrap(),
                }
            }

            pub fn sample(&self) -> usize {
                self.epoch_mib.advance().unwrap();
                self.allocated_mib.read().unwrap()
            }
        }
    } else {
        pub struct MemSampler {}

        impl MemSampler {
            pub fn new() -> Self {
                println!("NOTE: memory sampling is supported only on linux.");
                MemSampler {}
            }

            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}
