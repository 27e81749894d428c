//! Demo object graph: a sorted list of people and a greeter type the
//! client can create.

use anyhow::bail;
use qbridge_core::{
    marshal_with_serde, Context, DataSource, Model, Object, QPtr, RowsBulkSource,
    SortableDataSource, TypeBuilder,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub name: String,
    pub age: i64,
}

marshal_with_serde!(Person);

/// People kept sorted by name.
#[derive(Default)]
pub struct PersonModel {
    model: Model,
    people: Vec<Person>,
}

impl PersonModel {
    fn add_person(&mut self, cx: &mut Context<'_>, name: String, age: i64) -> anyhow::Result<()> {
        if name.trim().is_empty() {
            bail!("name must not be empty");
        }
        let start = self.people.len();
        self.people.push(Person { name, age });
        cx.sort_inserted(self, start, start + 1);
        Ok(())
    }

    fn remove_person(&mut self, cx: &mut Context<'_>, row: usize) -> anyhow::Result<()> {
        if row >= self.people.len() {
            bail!("no person at row {}", row);
        }
        self.people.remove(row);
        cx.model_removed(self, row, 1);
        Ok(())
    }

    fn update_person(&mut self, cx: &mut Context<'_>, row: usize, age: i64) -> anyhow::Result<()> {
        let Some(person) = self.people.get_mut(row) else {
            bail!("no person at row {}", row);
        };
        person.age = age;
        cx.model_updated(self, row);
        Ok(())
    }
}

impl Object for PersonModel {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.model()
            .method(
                "addPerson",
                |m: &mut PersonModel, cx, (name, age): (String, i64)| m.add_person(cx, name, age),
            )
            .method("removePerson", |m: &mut PersonModel, cx, (row,): (usize,)| {
                m.remove_person(cx, row)
            })
            .method(
                "updatePerson",
                |m: &mut PersonModel, cx, (row, age): (usize, i64)| m.update_person(cx, row, age),
            );
    }
}

impl DataSource for PersonModel {
    type Row = Person;

    fn model(&self) -> &Model {
        &self.model
    }

    fn row_count(&self) -> usize {
        self.people.len()
    }

    fn row(&self, row: usize) -> Person {
        self.people[row].clone()
    }

    fn role_names(&self) -> Vec<String> {
        vec!["name".to_string(), "age".to_string()]
    }

    fn as_bulk(&self) -> Option<&dyn RowsBulkSource<Row = Person>> {
        Some(self)
    }
}

impl RowsBulkSource for PersonModel {
    type Row = Person;

    fn rows(&self) -> &[Person] {
        &self.people
    }
}

impl SortableDataSource for PersonModel {
    fn row_less(&self, a: usize, b: usize) -> bool {
        self.people[a].name < self.people[b].name
    }

    fn row_move(&mut self, src: usize, dst: usize) {
        let person = self.people.remove(src);
        self.people.insert(dst, person);
    }
}

/// Client-creatable object that answers greetings with a signal.
#[derive(Clone)]
pub struct Greeter {
    pub greeting: String,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
        }
    }
}

impl Object for Greeter {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.property("greeting", |g: &Greeter| &g.greeting)
            .method("greet", |g: &mut Greeter, cx, (name,): (String,)| {
                let message = format!("{}, {}!", g.greeting, name);
                cx.emit_this("greeted", (message,));
            })
            .signal::<(String,)>("greeted", &["message"]);
    }
}

/// Root of the demo graph.
pub struct Directory {
    people: QPtr<PersonModel>,
    status: String,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            people: QPtr::new(PersonModel::default()),
            status: "ready".to_string(),
        }
    }

    fn set_status(&mut self, cx: &mut Context<'_>, status: String) {
        info!("Status set to {}", status);
        self.status = status;
        cx.changed_this("status");
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Object for Directory {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.property("people", |d: &Directory| &d.people)
            .property("status", |d: &Directory| &d.status)
            .method("setStatus", |d: &mut Directory, cx, (status,): (String,)| {
                d.set_status(cx, status)
            });
    }
}
