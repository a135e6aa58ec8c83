mod pool;

pub use pool::{Handle, HandlePool, PoolError, PoolStats, MAX_SLOTS};

//definitions
//handle: index + generation packed into one u32, generation 0 means null
//a slot keeps the generation of its current occupant, 0 while vacant
//freed indexes go onto a stack so the most recently vacated slot is
//handed out again first
