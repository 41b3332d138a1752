pub mod codec;
pub mod descriptor;
pub mod map;
pub mod transport;

pub use codec::{decode, encode};
pub use descriptor::{Encoder, ReadWrite, RegisterDescriptor, RegisterKind, RegisterType};
pub use map::{ReadWindow, RegisterMap};
pub use transport::{read_all_registers, read_all_registers_chunked, read_by_ident, write_by_ident, RegisterTransport};
