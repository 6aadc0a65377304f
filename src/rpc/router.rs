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

//! Method-name routing of serialized calls. Handlers are registered as plain
//! functions or closures; the router derives the argument tuple decoder and
//! the return-value encoder at registration time.

use std::collections::HashMap;

use itertools::Itertools;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::prelude::*;
use crate::rpc::buffer::Buffer;
use crate::rpc::serializer::Serializer;
use crate::rpc::serializer::Wire;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RpcErrorCode {
    Success = 0,
    MethodNotFound = 1,
}

impl Wire for RpcErrorCode {
    fn wire_write(&self, buf: &mut Buffer) {
        u8::from(*self).wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Self::try_from(u8::wire_read(buf).location(loc!())?).location(loc!())
    }
}

/// The `(error_code, payload)` pair a call produces. `ret` is empty unless
/// the call succeeded and the handler returned a value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RpcReply {
    pub error_code: RpcErrorCode,
    pub ret: Buffer,
}

impl RpcReply {
    pub fn success(&self) -> bool {
        self.error_code == RpcErrorCode::Success
    }
}

impl Wire for RpcReply {
    fn wire_write(&self, buf: &mut Buffer) {
        self.error_code.wire_write(buf);
        self.ret.wire_write(buf);
    }

    fn wire_read(buf: &mut Buffer) -> Result<Self> {
        Ok(Self {
            error_code: RpcErrorCode::wire_read(buf).location(loc!())?,
            ret: Buffer::wire_read(buf).location(loc!())?,
        })
    }
}

type WrappedHandler = Box<dyn Fn(&mut Serializer) -> Result<Buffer> + Send + Sync>;

/// Implemented for any `Fn(A1, …, An) -> R` (arity ≤ 4) whose arguments and
/// return type are [`Wire`]. The blanket impls take the place of a
/// function-traits inspection: the argument tuple type is fixed by the
/// closure's signature at registration.
pub trait RpcHandler<Args> {
    fn wrap(self) -> WrappedHandler;
}

macro_rules! impl_rpc_handler {
    ($($arg:ident),*) => {
        impl<Fun, Ret, $($arg),*> RpcHandler<($($arg,)*)> for Fun
        where
            Fun: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: Wire,
            $($arg: Wire,)*
        {
            fn wrap(self) -> WrappedHandler {
                Box::new(move |args| {
                    #[allow(non_snake_case)]
                    let ($($arg,)*) = args.read::<($($arg,)*)>().location(loc!())?;
                    let ret = self($($arg),*);
                    let mut out = Serializer::new();
                    out.write(&ret);
                    Ok(out.into_buffer())
                })
            }
        }
    };
}

impl_rpc_handler!();
impl_rpc_handler!(A1);
impl_rpc_handler!(A1, A2);
impl_rpc_handler!(A1, A2, A3);
impl_rpc_handler!(A1, A2, A3, A4);

/// Name → handler table. Registration happens before the service starts and
/// the table is read-only afterwards.
#[derive(Default)]
pub struct RpcRouter {
    handlers: HashMap<String, WrappedHandler>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Args>(&mut self, name: impl Into<String>, func: impl RpcHandler<Args>) {
        self.handlers.insert(name.into(), func.wrap());
    }

    /// Dispatches `args` to the named handler. An unknown method is reported
    /// in-band; a handler that cannot decode its arguments is a protocol
    /// violation and surfaces as an error.
    pub fn call(&self, method: &str, args: Buffer) -> Result<RpcReply> {
        let Some(handler) = self.handlers.get(method) else {
            debug!("method not found: {method}");
            return Ok(RpcReply {
                error_code: RpcErrorCode::MethodNotFound,
                ret: Buffer::default(),
            });
        };
        let mut args = Serializer::from(args);
        let ret = handler(&mut args)
            .with_context(loc!(), || format!("malformed arguments for {method}"))?;
        Ok(RpcReply {
            error_code: RpcErrorCode::Success,
            ret,
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().sorted().collect()
    }
}

/// Encodes a call's argument tuple into a standalone buffer.
pub fn args_to_buffer<T: Wire>(args: &T) -> Buffer {
    let mut ser = Serializer::new();
    ser.write(args);
    ser.into_buffer()
}

/// Decodes a reply payload produced by a handler back into its return type.
pub fn return_value_from_buffer<T: Wire>(ret: Buffer) -> Result<T> {
    Serializer::from(ret).read::<T>().location(loc!())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    #[test]
    fn test_registered_function_add() {
        let mut router = RpcRouter::new();
        router.register("Add", add);

        let reply = router.call("Add", args_to_buffer(&(2i32, 3i32))).unwrap();
        assert!(reply.success());
        assert_eq!(return_value_from_buffer::<i32>(reply.ret).unwrap(), 5);
    }

    #[test]
    fn test_missing_method() {
        let mut router = RpcRouter::new();
        router.register("Add", add);

        let reply = router
            .call("Multiply", args_to_buffer(&(2i32, 3i32)))
            .unwrap();
        assert_eq!(reply.error_code, RpcErrorCode::MethodNotFound);
        assert!(reply.ret.is_empty());
        assert!(!reply.success());
    }

    #[test]
    fn test_closure_capture_and_arities() {
        let base = 100u64;
        let mut router = RpcRouter::new();
        router.register("Nullary", move || base);
        router.register("Concat", |a: String, b: String, c: String| a + &b + &c);

        let reply = router.call("Nullary", Buffer::default()).unwrap();
        assert_eq!(return_value_from_buffer::<u64>(reply.ret).unwrap(), 100);

        let args = args_to_buffer(&("a".to_string(), "b".to_string(), "c".to_string()));
        let reply = router.call("Concat", args).unwrap();
        assert_eq!(
            return_value_from_buffer::<String>(reply.ret).unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_malformed_arguments_are_an_error() {
        let mut router = RpcRouter::new();
        router.register("Add", add);
        assert!(router.call("Add", Buffer::from_bytes(&[1])).is_err());
    }

    #[test]
    fn test_methods_listing() {
        let mut router = RpcRouter::new();
        router.register("B", || 0u8);
        router.register("A", || 0u8);
        assert_eq!(router.methods(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = RpcReply {
            error_code: RpcErrorCode::Success,
            ret: Buffer::from_bytes(&[1, 2, 3]),
        };
        let mut ser = Serializer::new();
        ser.write(&reply);
        assert_eq!(ser.read::<RpcReply>().unwrap(), reply);
    }
}
