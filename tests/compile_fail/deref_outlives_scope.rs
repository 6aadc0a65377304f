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

use farmem::deref_scope::DerefScope;

fn works_while_the_scope_is_live(
    array: &farmem::array::Array<i32>,
) -> Result<(), anyhow::Error> {
    let scope = DerefScope::new();
    let elem = array.at(&scope, 0)?;
    let _ = *elem;
    Ok(())
}

fn does_not_compile_when_the_borrow_escapes(
    array: &farmem::array::Array<i32>,
) -> Result<i32, anyhow::Error> {
    let elem = {
        let scope = DerefScope::new();
        array.at(&scope, 0)?
    };
    Ok(*elem)
}

fn main() {}
