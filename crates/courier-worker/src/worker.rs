//! Demo implementation served by the worker process.

use courier_core::{CourierError, MethodTable, Value};

fn string_arg(args: &[Value], index: usize) -> Result<String, CourierError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CourierError::InvalidArguments {
            message: format!("argument {} must be a string", index),
        })
}

/// Build the worker's method table.
///
/// - `echo(value)`: returns `value`
/// - `repeat(value, times)`: returns a list holding `value` `times` times
/// - `hollaback(value, callback)`: calls `callback(value)` in the parent and
///   returns its result uppercased
/// - `add(numbers...)`: sums its numeric arguments
/// - `fail(message)`: always fails with `message`
pub fn echo_worker(name: &str) -> MethodTable {
    MethodTable::new(name)
        .sync_method("echo", |args| Ok(args.into_iter().next().unwrap_or_default()))
        .sync_method("repeat", |args| {
            let value = args.first().cloned().unwrap_or_default();
            let times = args.get(1).and_then(Value::as_u64).ok_or_else(|| {
                CourierError::InvalidArguments {
                    message: "argument 1 must be a count".to_string(),
                }
            })?;
            Ok(Value::List(vec![value; times as usize]))
        })
        .method("hollaback", |args| async move {
            let input = args.first().cloned().unwrap_or_default();
            let callback = args
                .get(1)
                .and_then(Value::as_callback)
                .cloned()
                .ok_or_else(|| CourierError::InvalidArguments {
                    message: "argument 1 must be a callback".to_string(),
                })?;

            let reply = callback.call(vec![input]).await?;
            let text = reply.as_str().ok_or_else(|| {
                CourierError::other(format!("callback returned {:?}, expected a string", reply))
            })?;
            Ok::<_, CourierError>(Value::from(text.to_uppercase()))
        })
        .sync_method("add", |args| {
            let mut total = 0.0;
            for arg in &args {
                total += arg.as_f64().ok_or_else(|| CourierError::InvalidArguments {
                    message: format!("cannot add {:?}", arg),
                })?;
            }
            Ok(Value::from(total))
        })
        .sync_method("fail", |args| {
            Err(CourierError::other(
                string_arg(&args, 0).unwrap_or_else(|_| "failed".to_string()),
            ))
        })
}
