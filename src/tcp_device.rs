// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The TCP transport: one long-lived control connection for Init/Shutdown
//! and a pool of request connections multiplexed through a free-list. A
//! request occupies its connection until the reply returns; transport
//! failures are fatal to the client runtime.

use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::device::FarMemDevice;
use crate::prelude::*;
use crate::protocol::Framed;
use crate::protocol::MAX_CALL_BODY_LEN;
use crate::protocol::MAX_OBJECT_DATA_LEN;
use crate::protocol::MAX_OBJECT_ID_LEN;
use crate::protocol::OpCode;
use crate::protocol::read_bytes;
use crate::rpc::Buffer;
use crate::rpc::RpcReply;
use crate::rpc::Serializer;

pub const DEFAULT_NUM_CONNECTIONS: usize = 512;

pub struct TcpDevice {
    control: Mutex<TcpStream>,
    idle_rx: Receiver<TcpStream>,
    idle_tx: Sender<TcpStream>,
}

impl TcpDevice {
    /// Connects the control connection, performs Init for `far_mem_size`
    /// bytes, then fills the request pool.
    pub fn new(addr: SocketAddr, num_connections: usize, far_mem_size: u64) -> Result<Self> {
        let mut control = TcpStream::connect(addr)
            .with_context(loc!(), || format!("connecting control connection to {addr}"))?;
        control.set_nodelay(true).location(loc!())?;

        OpCode::Init.framed_write(&mut control).location(loc!())?;
        far_mem_size.framed_write(&mut control).location(loc!())?;
        let _ack = u8::framed_read(&mut control).location(loc!())?;
        debug!("initialised far memory of {far_mem_size} bytes at {addr}");

        let (idle_tx, idle_rx) = crossbeam_channel::unbounded();
        for _ in 0..num_connections.max(1) {
            let stream = TcpStream::connect(addr).location(loc!())?;
            stream.set_nodelay(true).location(loc!())?;
            idle_tx.send(stream).location(loc!())?;
        }
        info!("connection pool of {} request connections ready", num_connections.max(1));

        Ok(Self {
            control: Mutex::new(control),
            idle_rx,
            idle_tx,
        })
    }

    /// Checks out an idle connection, runs the request, and returns the
    /// connection to the pool. An IO failure drops the connection: cached
    /// state is meaningless once the transport is gone, so the error is
    /// propagated as fatal rather than retried.
    fn request<R>(&self, f: impl FnOnce(&mut TcpStream) -> Result<R>) -> Result<R> {
        let mut stream = self.idle_rx.recv().location(loc!())?;
        let result = f(&mut stream);
        if result.is_ok() {
            self.idle_tx.send(stream).location(loc!())?;
        }
        result
    }
}

impl FarMemDevice for TcpDevice {
    fn read_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<Vec<u8>> {
        ensure!(obj_id.len() <= MAX_OBJECT_ID_LEN, "object id too long");
        self.request(|stream| {
            OpCode::ReadObject.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            (obj_id.len() as u8).framed_write(stream).location(loc!())?;
            stream.write_all(obj_id).location(loc!())?;

            let data_len = u16::framed_read(stream).location(loc!())?;
            read_bytes(stream, data_len as usize).location(loc!())
        })
    }

    fn write_object(&self, ds_id: u8, obj_id: &[u8], data: &[u8]) -> Result<()> {
        ensure!(obj_id.len() <= MAX_OBJECT_ID_LEN, "object id too long");
        ensure!(data.len() <= MAX_OBJECT_DATA_LEN, "object data too long");
        self.request(|stream| {
            OpCode::WriteObject.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            (obj_id.len() as u8).framed_write(stream).location(loc!())?;
            (data.len() as u16).framed_write(stream).location(loc!())?;
            stream.write_all(obj_id).location(loc!())?;
            stream.write_all(data).location(loc!())?;

            let _ack = u8::framed_read(stream).location(loc!())?;
            Ok(())
        })
    }

    fn remove_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<bool> {
        ensure!(obj_id.len() <= MAX_OBJECT_ID_LEN, "object id too long");
        self.request(|stream| {
            OpCode::RemoveObject.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            (obj_id.len() as u8).framed_write(stream).location(loc!())?;
            stream.write_all(obj_id).location(loc!())?;

            Ok(u8::framed_read(stream).location(loc!())? != 0)
        })
    }

    fn construct(&self, ds_type: u8, ds_id: u8, params: &[u8]) -> Result<()> {
        ensure!(params.len() <= u8::MAX as usize, "construct params too long");
        self.request(|stream| {
            OpCode::Construct.framed_write(stream).location(loc!())?;
            ds_type.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            (params.len() as u8).framed_write(stream).location(loc!())?;
            stream.write_all(params).location(loc!())?;

            let _ack = u8::framed_read(stream).location(loc!())?;
            Ok(())
        })
    }

    fn destruct(&self, ds_id: u8) -> Result<()> {
        self.request(|stream| {
            OpCode::Destruct.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;

            let _ack = u8::framed_read(stream).location(loc!())?;
            Ok(())
        })
    }

    fn compute(&self, ds_id: u8, opcode: u8, input: &[u8]) -> Result<Vec<u8>> {
        ensure!(input.len() <= MAX_OBJECT_DATA_LEN, "compute input too long");
        self.request(|stream| {
            OpCode::Compute.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            opcode.framed_write(stream).location(loc!())?;
            (input.len() as u16).framed_write(stream).location(loc!())?;
            stream.write_all(input).location(loc!())?;

            let output_len = u16::framed_read(stream).location(loc!())?;
            read_bytes(stream, output_len as usize).location(loc!())
        })
    }

    fn call(&self, ds_id: u8, method: &str, args: &Buffer) -> Result<RpcReply> {
        let mut body = Serializer::new();
        body.write(&method.to_string());
        let mut body = body.into_buffer();
        body.append(args.readable());
        ensure!(
            body.readable_bytes() <= MAX_CALL_BODY_LEN,
            "call body of {} bytes exceeds the wire limit",
            body.readable_bytes()
        );

        self.request(|stream| {
            OpCode::Call.framed_write(stream).location(loc!())?;
            ds_id.framed_write(stream).location(loc!())?;
            (body.readable_bytes() as u16)
                .framed_write(stream)
                .location(loc!())?;
            stream.write_all(body.readable()).location(loc!())?;

            let ret_len = u16::framed_read(stream).location(loc!())?;
            let payload = read_bytes(stream, ret_len as usize).location(loc!())?;
            Serializer::from(Buffer::from_bytes(&payload))
                .read::<RpcReply>()
                .location(loc!())
        })
    }

    fn shutdown(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap();
        OpCode::Shutdown.framed_write(&mut *control).location(loc!())?;
        let _ack = u8::framed_read(&mut *control).location(loc!())?;
        debug!("far-memory server acknowledged shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::protocol::DS_TYPE_ARRAY;
    use crate::protocol::DS_TYPE_HEAP;
    use crate::rpc::RpcErrorCode;
    use crate::rpc::router::args_to_buffer;
    use crate::rpc::router::return_value_from_buffer;
    use crate::server;

    /// Request and reply survive a trip through the real server loop.
    #[test]
    fn test_loopback_wire_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || server::serve(listener).unwrap());

        let device = TcpDevice::new(addr, 4, 32 << 20).unwrap();

        device.construct(DS_TYPE_HEAP, 1, &[]).unwrap();
        device.write_object(1, b"greeting", b"hello far memory").unwrap();
        assert_eq!(
            device.read_object(1, b"greeting").unwrap(),
            b"hello far memory"
        );
        assert!(device.remove_object(1, b"greeting").unwrap());
        assert!(!device.remove_object(1, b"greeting").unwrap());

        let mut params = Serializer::new();
        params.write(&16u64).write(&4u32);
        device
            .construct(DS_TYPE_ARRAY, 2, &params.into_buffer().retrieve_all())
            .unwrap();

        let reply = device
            .call(2, "Add", &args_to_buffer(&(2i32, 3i32)))
            .unwrap();
        assert!(reply.success());
        assert_eq!(return_value_from_buffer::<i32>(reply.ret).unwrap(), 5);

        let reply = device
            .call(2, "Multiply", &args_to_buffer(&(2i32, 3i32)))
            .unwrap();
        assert_eq!(reply.error_code, RpcErrorCode::MethodNotFound);
        assert!(reply.ret.is_empty());

        // Compute stays a reserved slot: empty output, no error.
        assert!(device.compute(2, 0, &[1, 2, 3]).unwrap().is_empty());

        device.destruct(2).unwrap();
        device.shutdown().unwrap();
        // Dropping the device closes the pool connections, which lets the
        // per-connection dispatchers drain and serve() return.
        drop(device);
        server.join().unwrap();
    }
}
