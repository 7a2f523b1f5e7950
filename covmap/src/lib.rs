/*!
Welcome to `covmap`

Run a target program once under a controlled input and collect the AFL-style
edge coverage map it produced, together with crash and timeout status.

A [`executors::CoverageExecutor`] owns one [`bolts::shmem::CoverageShMem`] and reuses it
for every [`executors::CoverageExecutor::capture`] call, so a fuzzing loop pays for
the shared memory setup only once.

```rust,no_run
use covmap::{
    executors::{CoverageExecutor, ExecutorConfig},
    inputs::{ExecutionRequest, InputSource},
};
use core::time::Duration;

# fn main() -> Result<(), covmap::Error> {
let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
let request = ExecutionRequest::new(["./target"], InputSource::from_bytes(b"FUZZ"))?
    .with_timeout(Duration::from_millis(500));
let result = executor.capture(request)?;
println!("{} edges, {:?}", result.coverage.count_nonzero(), result.exit_kind());
# Ok(())
# }
```
*/
#![allow(clippy::module_name_repetitions)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]

pub use covmap_bolts as bolts;
pub use covmap_bolts::Error;

#[cfg(unix)]
pub mod executors;
#[cfg(unix)]
pub mod inputs;
