//! `fortify-init`: PID 1 inside a fortify sandbox.
//!
//! Started by the shim through a namespace clone; reads its parameters
//! from the descriptor named by `FORTIFY_SETUP`.

fn main() {
    fortify_sandbox::init::main()
}
