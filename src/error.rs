// Copyright (C) 2026 packetbuf contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketBufError {
    #[error("invalid argument or buffer not ready")]
    InvalidArgument,

    #[error("lock or packet not immediately available")]
    Busy,

    #[error("packet cannot fit into the buffer")]
    NoBufferSpace,

    #[error("span crosses the arena wrap, retry with fake dma")]
    WouldCrossWrap,

    #[error("buffer cancelled")]
    Interrupted,

    #[error("bounce buffer allocation failed")]
    OutOfMemory,

    #[error("feature compiled out")]
    NotSupported,

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, PacketBufError>;
