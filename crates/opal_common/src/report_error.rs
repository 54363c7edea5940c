use std::io;

/// Implemented by every error surfaced to the user of the toolchain, fatal or not.
pub trait Reportable {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()>;

    fn exit_status(&self) -> i32 {
        1
    }
}
