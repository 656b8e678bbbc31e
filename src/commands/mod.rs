/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `run`: Consume the change stream and deliver notifications
- `checkpoint`: Show, set or clear the stored resume position
- `dlq`: List, show, purge and replay dead-lettered notifications

Handlers are thin: they open the configured stores and hand off to the
library components.
*/

pub mod checkpoint;
pub mod dlq;
pub mod r#run;
