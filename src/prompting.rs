use minijinja::{context, Environment};

const RECOVERY_MESSAGE_TEMPLATE: &str = include_str!("prompts/recovery_message.j2");
const ANSWER_SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/answer_system_prompt.j2");
const ANSWER_USER_PROMPT_TEMPLATE: &str = include_str!("prompts/answer_user_prompt.j2");

pub struct RecoveryMessageContext<'a> {
    pub name: &'a str,
    pub product: &'a str,
}

pub struct AnswerPromptContext<'a> {
    pub business_name: &'a str,
    pub customer_name: &'a str,
    pub product: &'a str,
    pub inbound_text: &'a str,
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    let rendered = template.render(ctx).ok()?;
    let rendered = rendered.trim().to_string();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

pub fn render_recovery_message(ctx: &RecoveryMessageContext<'_>) -> String {
    render(
        "recovery_message",
        RECOVERY_MESSAGE_TEMPLATE,
        context! {
            name => ctx.name.trim(),
            product => ctx.product.trim(),
        },
    )
    .unwrap_or_else(|| fallback_recovery_message(ctx))
}

fn fallback_recovery_message(ctx: &RecoveryMessageContext<'_>) -> String {
    let greeting = if ctx.name.trim().is_empty() {
        "Hi!".to_string()
    } else {
        format!("Hi {}!", ctx.name.trim())
    };
    let product = if ctx.product.trim().is_empty() {
        "your order"
    } else {
        ctx.product.trim()
    };
    format!("{greeting} You left {product} waiting at checkout. Reply here if you need any help.")
}

pub fn render_answer_system_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    render(
        "answer_system_prompt",
        ANSWER_SYSTEM_PROMPT_TEMPLATE,
        context! {
            business_name => ctx.business_name.trim(),
            product => ctx.product.trim(),
        },
    )
    .unwrap_or_else(|| fallback_answer_system_prompt(ctx))
}

fn fallback_answer_system_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    let mut prompt = String::from(
        "You are a sales assistant replying to a customer who abandoned checkout.\n\
         Answer briefly in the customer's language. Never invent facts.\n",
    );
    if !ctx.business_name.trim().is_empty() {
        prompt.push_str(&format!("Business: {}\n", ctx.business_name.trim()));
    }
    if !ctx.product.trim().is_empty() {
        prompt.push_str(&format!("Product: {}\n", ctx.product.trim()));
    }
    prompt
}

pub fn render_answer_user_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    render(
        "answer_user_prompt",
        ANSWER_USER_PROMPT_TEMPLATE,
        context! {
            customer_name => ctx.customer_name.trim(),
            product => ctx.product.trim(),
            inbound_text => ctx.inbound_text.trim(),
        },
    )
    .unwrap_or_else(|| ctx.inbound_text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_recovery_message_includes_name_and_product() {
        let text = render_recovery_message(&RecoveryMessageContext {
            name: " Ana ",
            product: "Running Shoes",
        });
        assert!(text.starts_with("Hi Ana!"));
        assert!(text.contains("Running Shoes"));
    }

    #[test]
    fn unit_recovery_message_degrades_without_name_or_product() {
        let text = render_recovery_message(&RecoveryMessageContext {
            name: "",
            product: "",
        });
        assert!(text.starts_with("Hi!"));
        assert!(text.contains("your order"));
    }

    #[test]
    fn unit_answer_prompts_carry_customer_context() {
        let ctx = AnswerPromptContext {
            business_name: "Loja Azul",
            customer_name: "Bruno",
            product: "Cafeteira",
            inbound_text: "tem frete grátis?",
        };
        let system = render_answer_system_prompt(&ctx);
        assert!(system.contains("Loja Azul"));
        assert!(system.contains("Cafeteira"));

        let user = render_answer_user_prompt(&ctx);
        assert!(user.contains("Customer name: Bruno"));
        assert!(user.ends_with("tem frete grátis?"));
    }

    #[test]
    fn unit_fallback_system_prompt_skips_blank_fields() {
        let prompt = fallback_answer_system_prompt(&AnswerPromptContext {
            business_name: " ",
            customer_name: "",
            product: "Cafeteira",
            inbound_text: "",
        });
        assert!(!prompt.contains("Business:"));
        assert!(prompt.contains("Product: Cafeteira"));
    }
}
