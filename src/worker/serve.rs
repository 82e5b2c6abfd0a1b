//! Child-side serve loop.
//!
//! A worker child process connects back to the unix-domain socket its
//! parent is listening on and answers [`Request`] frames until it is told
//! to stop. Every non-shutdown request produces exactly one [`Response`];
//! the child never initiates a message.

use std::io::{self, BufReader, BufWriter};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::worker::eval::Evaluator;
use crate::worker::protocol::{read_frame, write_frame, Request, Response};

/// Connects to `pipe` and serves evaluation requests until shutdown.
///
/// The loop ends when a request with the shutdown flag arrives or the
/// parent closes the pipe (clean EOF). Evaluation failures are answered as
/// error responses, not treated as loop failures; only transport problems
/// end the loop with an error.
pub fn serve_requests<E: Evaluator>(pipe: &Path, mut evaluator: E) -> io::Result<()> {
    let stream = UnixStream::connect(pipe)?;
    tracing::info!(pipe = %pipe.display(), "worker child connected");

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        let Some(request) = read_frame::<_, Request>(&mut reader)? else {
            tracing::info!("parent closed the pipe; worker child exiting");
            return Ok(());
        };

        if request.shutdown {
            tracing::info!("shutdown request received; worker child exiting");
            return Ok(());
        }

        tracing::debug!(id = request.id, module = %request.module, "evaluating request");
        let response = match evaluator.eval(&request.module, &request.expr) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => {
                tracing::debug!(id = request.id, error = %err, "evaluation failed");
                Response::err(request.id, err)
            }
        };
        write_frame(&mut writer, &response)?;
    }
}
