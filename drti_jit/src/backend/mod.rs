//! Target back ends. x86-64 is the only implemented target; the
//! carrier-register choice makes each target a separate port.

pub mod x64;
